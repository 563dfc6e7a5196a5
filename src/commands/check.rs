//! Validate a composition and show its start order

use std::path::Path;

use composed::config::{CompositeConfig, ReadyCheck};

use super::init_logging;

pub async fn check(path: &Path, log_level: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = CompositeConfig::load(path).await?;
    init_logging(log_level.or(config.log_level.as_deref()));

    let resolved = config.resolved_services();
    let (graph, options) = config.into_graph()?;

    println!("{}: {} services", path.display(), graph.len());
    println!();
    println!("Start order:");
    for (index, id) in graph.start_order().iter().enumerate() {
        let deps: Vec<&str> = graph.dependencies(id).map(String::as_str).collect();
        let ready = resolved
            .iter()
            .find(|(other, _)| other == id)
            .and_then(|(_, settings)| settings.ready.as_ref())
            .map(describe_ready)
            .unwrap_or_else(|| "immediately".to_string());

        if deps.is_empty() {
            println!("  {}. {} (ready {})", index + 1, id, ready);
        } else {
            println!("  {}. {} (ready {}, after {})", index + 1, id, ready, deps.join(", "));
        }
    }

    println!();
    println!(
        "Graceful shutdown: {}",
        if options.graceful_shutdown { "yes" } else { "no" }
    );
    if options.windows_ctrl_c_shutdown {
        println!("Windows Ctrl+C shutdown: yes");
    }

    Ok(())
}

fn describe_ready(check: &ReadyCheck) -> String {
    match check {
        ReadyCheck::OutputLine(text) => format!("on line '{}'", text),
        ReadyCheck::OutputIncludes(text) => format!("on output containing '{}'", text),
        ReadyCheck::TcpPort { host, port } => format!("when {}:{} accepts", host, port),
        ReadyCheck::HttpOk { url, status } => format!("when {} answers {}", url, status),
        ReadyCheck::Delay(delay) => format!("after {:?}", delay),
    }
}
