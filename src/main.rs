use anyhow::{bail, Result};
use clap::Parser;
use log::info;
use serde::Serialize;
use serde_json::json;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use hotspot_dnsd::{
    cli::{self, Args, Command},
    config::Config,
    daemon, logging,
    system::HostSystem,
    ClientId, DnsOverrideEngine,
};

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let args = Args::parse();

    // iptables and resolver ports need root; fail before touching anything.
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("hotspot-dnsd: root privileges are required");
        bail!("root privileges are required");
    }

    let cfg = match &args.config {
        Some(p) => Config::load(p)?,
        None => Config::default(),
    };
    logging::init(&cfg)?;

    let mut engine = DnsOverrideEngine::new(&cfg, Arc::new(HostSystem));

    match args.command {
        Command::Create { address, id } => {
            let id = match id {
                Some(s) => ClientId::new(&s)?,
                None => ClientId::from_address(address),
            };
            let alloc = engine.create_client(&id, address)?;
            print_json(&json!({ "id": id, "address": alloc.client_address, "port": alloc.assigned_port }))?;
        }
        Command::Update { id, overrides, domains, clear_domains } => {
            let id = ClientId::new(&id)?;
            let current = engine.client_settings(&id)?;
            engine.update_settings(&id, cli::merge_client(current, &overrides, &domains, clear_domains))?;
            print_json(&engine.status(&id)?)?;
        }
        Command::Global { default_resolver, overrides } => {
            let next = cli::merge_global(engine.global_settings(), default_resolver, &overrides);
            engine.update_global(next)?;
            print_json(&engine.global_settings())?;
        }
        Command::Delete { id } => {
            let report = engine.delete_client(&ClientId::new(&id)?);
            print_json(&report)?;
        }
        Command::List => print_json(&engine.list()?)?,
        Command::Status { id } => print_json(&engine.status(&ClientId::new(&id)?)?)?,
        Command::Restore => {
            let failed = engine.restore_all();
            let out: Vec<_> = failed.iter().map(|(id, e)| json!({ "id": id, "error": e.to_string() })).collect();
            print_json(&out)?;
            if !failed.is_empty() {
                bail!("{} client(s) failed to restore", failed.len());
            }
        }
        Command::Watch => {
            unsafe {
                libc::signal(libc::SIGTERM, on_terminate as libc::sighandler_t);
                libc::signal(libc::SIGINT, on_terminate as libc::sighandler_t);
            }
            info!("hotspot-dnsd watching (base_dir={})", cfg.base_dir.display());
            let shared = Arc::new(Mutex::new(engine));
            daemon::watch(&shared, Duration::from_millis(cfg.runtime.tick_ms.max(100)), &STOP);
        }
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}
