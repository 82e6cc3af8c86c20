//! The bundled `domains/microservice` directory and `rca.toml` load cleanly.

use std::path::PathBuf;

use rca::core::answer::FinalAnswer;
use rca::io::config::{RcaConfig, load_config};
use rca::io::domain::DomainContext;

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

/// Every candidate section parses and components exclude the reason list.
#[test]
fn microservice_domain_loads() {
    let domain =
        DomainContext::load(&workspace_root().join("domains/microservice")).expect("load domain");
    let taxonomy = domain.taxonomy();

    assert!(taxonomy.contains_component("frontend"));
    assert!(taxonomy.contains_component("redis-cart-0"));
    assert!(taxonomy.contains_component("aiops-k8s-03"));
    assert!(!taxonomy.contains_component("CPU load"));
    assert!(taxonomy.reasons().any(|reason| reason == "CPU load"));
}

/// An answer naming a shipped pod passes the contract.
#[test]
fn microservice_answer_validates() {
    let domain =
        DomainContext::load(&workspace_root().join("domains/microservice")).expect("load domain");
    let answer = r#"{
        "component": "checkoutservice-1",
        "reason": "network latency",
        "reasoning_trace": [
            {"step": 1, "action": "LoadMetrics(checkoutservice)", "observation": "rrt p95 rose from 40ms to 2.1s at 10:12"}
        ]
    }"#;
    let parsed = FinalAnswer::parse(answer, domain.taxonomy()).expect("valid answer");
    assert_eq!(parsed.component, "checkoutservice-1");
}

/// The checked-in config matches the built-in defaults.
#[test]
fn bundled_config_is_default() {
    let cfg = load_config(&workspace_root().join("rca.toml")).expect("load config");
    assert_eq!(cfg, RcaConfig::default());
}
