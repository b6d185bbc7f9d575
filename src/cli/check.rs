//! `orgflow check`: one bootstrap evaluation, printed.

use crate::server::{build_connector, cli_error, load_validated_config};
use orgflow_core::{BootstrapMachine, ConnectionEvents};

pub async fn run() -> anyhow::Result<()> {
    let config = load_validated_config()?;
    let events = ConnectionEvents::default();
    let connector = build_connector(&config, &events, false)?;
    let machine = BootstrapMachine::new(connector, config.state_backend());

    let stage = machine.evaluate().await.map_err(cli_error)?;
    println!("organization: {}", config.organization);
    println!("stage:        {}", stage);
    if stage.is_active_orchestrator() {
        println!("role:         controller orchestrates");
    } else {
        println!("role:         passive, external CI owns provisioning");
    }

    if let Some(session) = machine.session().await {
        session.close().await.map_err(cli_error)?;
    }
    Ok(())
}
