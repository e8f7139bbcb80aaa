use anyhow::{Context, Result};
use retort_core::drivers::DriverRegistry;
use retort_core::engine::ProcessEngine;
use retort_core::sim::SimRig;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let positional: Vec<&String> = args[1..].iter().filter(|a| !a.starts_with("--")).collect();
    let [machine_path, process_path] = positional.as_slice() else {
        eprintln!("usage: retort [--list-drivers] <machineConfig.json> <processConfig.json>");
        std::process::exit(2);
    };

    let machine: Value = read_json(machine_path.as_str())?;
    let process: Value = read_json(process_path.as_str())?;

    // every driverKey in the machine config gets a simulated handle
    let drivers = build_sim_drivers(&machine);
    if args.iter().any(|a| a == "--list-drivers") {
        for key in drivers.keys() {
            println!("{key}");
        }
        return Ok(());
    }

    let mut engine = ProcessEngine::new(drivers);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            println!("{message}");
        }
    });

    let outcome = engine.run(&machine, &process, &tx).await;
    drop(tx);
    printer.await?;

    if !outcome.is_complete() {
        tracing::warn!(?outcome, "run did not complete");
        std::process::exit(1);
    }
    Ok(())
}

fn read_json(path: &str) -> Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {path}"))
}

/// Wire a simulated machine behind the config's driver keys: measurers
/// poll their variable, effectors with a control variable push it, and
/// everything else logs its writes.
fn build_sim_drivers(machine: &Value) -> DriverRegistry {
    let mut rig = SimRig::new();

    if let Some(variables) = machine.get("variables").and_then(Value::as_object) {
        for name in variables.keys() {
            rig.add_variable(name.clone(), 20.0, 20.0, 0.5);
        }
    }
    if let Some(measurers) = machine.get("measurers").and_then(Value::as_object) {
        for record in measurers.values() {
            let key = record.get("driverKey").and_then(Value::as_str);
            let variable = record.get("variable").and_then(Value::as_str);
            if let (Some(key), Some(variable)) = (key, variable) {
                rig.wire_measurer(key, variable);
            }
        }
    }
    if let Some(effectors) = machine.get("effectors").and_then(Value::as_object) {
        for record in effectors.values() {
            let Some(key) = record.get("driverKey").and_then(Value::as_str) else {
                continue;
            };
            match record.get("controlVariable").and_then(Value::as_str) {
                Some(variable) => rig.wire_effector(key, variable, 5.0),
                None => rig.wire_logger(key),
            }
        }
    }
    rig.into_registry()
}
