use anyhow::Result;
use fluxion_engine::ConnectorRegistry;

/// Execute the `connectors` command: list built-in connectors and options.
pub fn execute(json: bool) -> Result<()> {
    let registry = ConnectorRegistry::with_builtins();
    let descriptors = registry.descriptors();

    if json {
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    for descriptor in descriptors {
        println!("  {} [{}]", descriptor.name, descriptor.kind);
        println!("    {}", descriptor.description);
        for option in descriptor.options {
            let mut notes = vec![option.kind.name().to_string()];
            if option.required {
                notes.push("required".to_string());
            }
            if let Some(default) = option.default_value {
                notes.push(format!("default {default}"));
            }
            println!("    - {:12} {} ({})", option.name, option.description, notes.join(", "));
        }
    }
    Ok(())
}
