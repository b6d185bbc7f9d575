//! `orgflow check-config`: resolve the configuration without connecting.

use crate::server::{cli_error, load_validated_config};
use orgflow_core::{ConnectionPlan, ConnectionProfile};

pub fn run() -> anyhow::Result<()> {
    let config = load_validated_config()?;
    let plan = ConnectionPlan::resolve(&config.broker).map_err(cli_error)?;

    println!("organization:    {}", config.organization);
    println!("deployment:      {}", config.broker.deployment_type);
    for profile in plan.profiles() {
        print!("{}", describe(profile));
    }
    println!("durable:         {}", config.consumer.durable_name);
    println!("max deliveries:  {}", config.consumer.max_deliveries);
    println!("lock ttl:        {}s", config.lock.ttl_secs);
    match &config.bootstrap.state_file {
        Some(path) => println!("state file:      {}", path.display()),
        None => println!("state file:      none"),
    }
    println!("\nConfiguration OK");
    Ok(())
}

fn describe(profile: &ConnectionProfile) -> String {
    let tls = if profile.tls.enabled {
        match &profile.tls.client_cert {
            Some(_) => "required, client certificate",
            None => "required",
        }
    } else {
        "off"
    };

    let mut out = format!(
        "profile:         {}\n  endpoints:     {}\n  credentials:   {}\n  tls:           {}\n",
        profile.name,
        profile.endpoints.join(", "),
        profile.credentials.kind(),
        tls
    );
    if let Some(domain) = &profile.jetstream_domain {
        out.push_str(&format!("  js domain:     {}\n", domain));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use orgflow_core::BrokerSettings;

    #[test]
    fn test_describe_hides_secrets() {
        let settings = BrokerSettings {
            deployment_type: orgflow_core::DeploymentType::ManagedCloud,
            jwt: Some("eyJhbGciOi".to_string()),
            nkey_seed: Some("SUAEXAMPLESEED".to_string()),
            ..BrokerSettings::default()
        };
        let plan = ConnectionPlan::resolve(&settings).unwrap();
        let text = describe(plan.primary());

        assert!(text.contains("managed_cloud"));
        assert!(text.contains("jwt_seed"));
        assert!(!text.contains("SUAEXAMPLESEED"));
        assert!(!text.contains("eyJhbGciOi"));
    }
}
