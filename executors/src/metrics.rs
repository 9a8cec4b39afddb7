use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounterVec, Registry, TextEncoder, register_int_counter_vec_with_registry,
};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();

    static ref TRANSACTIONS_BROADCAST: IntCounterVec = register_int_counter_vec_with_registry!(
        "txengine_transactions_broadcast_total",
        "Transaction attempts accepted by the chain node",
        &["chain_id"],
        REGISTRY
    )
    .expect("Failed to register broadcast counter");

    static ref GAS_BUMPS: IntCounterVec = register_int_counter_vec_with_registry!(
        "txengine_gas_bumps_total",
        "Replacement attempts created for stalled transactions",
        &["chain_id"],
        REGISTRY
    )
    .expect("Failed to register gas bump counter");

    static ref TRANSACTIONS_CONFIRMED: IntCounterVec = register_int_counter_vec_with_registry!(
        "txengine_transactions_confirmed_total",
        "Transactions with a mined receipt recorded",
        &["chain_id"],
        REGISTRY
    )
    .expect("Failed to register confirmed counter");

    static ref FATALLY_ERRORED: IntCounterVec = register_int_counter_vec_with_registry!(
        "txengine_transactions_fatally_errored_total",
        "Transactions rejected by the chain node with no path to inclusion",
        &["chain_id"],
        REGISTRY
    )
    .expect("Failed to register fatal error counter");
}

pub fn record_broadcast(chain_id: u64) {
    TRANSACTIONS_BROADCAST
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_gas_bump(chain_id: u64) {
    GAS_BUMPS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_confirmed(chain_id: u64) {
    TRANSACTIONS_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fatal_error(chain_id: u64) {
    FATALLY_ERRORED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

/// Render the engine's metrics in the Prometheus text exposition format,
/// for whatever scrape surface the embedding process exposes.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_rendered_output() {
        record_broadcast(3);
        record_confirmed(3);

        let rendered = render();
        assert!(rendered.contains("txengine_transactions_broadcast_total"));
        assert!(rendered.contains("txengine_transactions_confirmed_total"));
    }
}
