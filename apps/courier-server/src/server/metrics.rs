use std::{
    collections::HashMap,
    fmt::Write as _,
    sync::{Mutex, OnceLock},
};

static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) token_rotations: Mutex<HashMap<&'static str, u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(String, String), u64>>,
    pub(crate) gateway_events_dropped: Mutex<HashMap<(String, String, String), u64>>,
    pub(crate) gateway_events_unknown_received: Mutex<HashMap<(String, String), u64>>,
    pub(crate) gateway_events_parse_rejected: Mutex<HashMap<(String, String), u64>>,
    pub(crate) offline_appends: Mutex<HashMap<&'static str, u64>>,
    pub(crate) offline_drained: Mutex<HashMap<&'static str, u64>>,
    pub(crate) store_faults: Mutex<HashMap<&'static str, u64>>,
}

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

fn snapshot<K: Clone>(counters: &Mutex<HashMap<K, u64>>) -> HashMap<K, u64> {
    counters
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone())
}

fn write_single_label_family(
    output: &mut String,
    name: &str,
    help: &str,
    label: &str,
    counters: HashMap<&'static str, u64>,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    let mut entries: Vec<_> = counters.into_iter().collect();
    entries.sort_by_key(|(value, _)| *value);
    for (value, count) in entries {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

pub(crate) fn render_metrics() -> String {
    let state = metrics_state();
    let mut output = String::new();

    write_single_label_family(
        &mut output,
        "courier_auth_failures_total",
        "Count of auth-related failures by reason",
        "reason",
        snapshot(&state.auth_failures),
    );
    write_single_label_family(
        &mut output,
        "courier_token_rotations_total",
        "Count of access tokens re-minted from a refresh token by surface",
        "surface",
        snapshot(&state.token_rotations),
    );
    write_single_label_family(
        &mut output,
        "courier_ws_disconnects_total",
        "Count of websocket disconnect events by reason",
        "reason",
        snapshot(&state.ws_disconnects),
    );

    output.push_str(
        "# HELP courier_gateway_events_emitted_total Count of emitted gateway events by scope and type\n",
    );
    output.push_str("# TYPE courier_gateway_events_emitted_total counter\n");
    let mut emitted_entries: Vec<_> = snapshot(&state.gateway_events_emitted)
        .into_iter()
        .collect();
    emitted_entries.sort();
    for ((scope, event_type), value) in emitted_entries {
        let _ = writeln!(
            output,
            "courier_gateway_events_emitted_total{{scope=\"{scope}\",event_type=\"{event_type}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP courier_gateway_events_dropped_total Count of dropped gateway events by scope, type, and reason\n",
    );
    output.push_str("# TYPE courier_gateway_events_dropped_total counter\n");
    let mut dropped_entries: Vec<_> = snapshot(&state.gateway_events_dropped)
        .into_iter()
        .collect();
    dropped_entries.sort();
    for ((scope, event_type, reason), value) in dropped_entries {
        let _ = writeln!(
            output,
            "courier_gateway_events_dropped_total{{scope=\"{scope}\",event_type=\"{event_type}\",reason=\"{reason}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP courier_gateway_events_unknown_received_total Count of unknown gateway events received by scope and event type\n",
    );
    output.push_str("# TYPE courier_gateway_events_unknown_received_total counter\n");
    let mut unknown_entries: Vec<_> = snapshot(&state.gateway_events_unknown_received)
        .into_iter()
        .collect();
    unknown_entries.sort();
    for ((scope, event_type), value) in unknown_entries {
        let _ = writeln!(
            output,
            "courier_gateway_events_unknown_received_total{{scope=\"{scope}\",event_type=\"{event_type}\"}} {value}"
        );
    }

    output.push_str(
        "# HELP courier_gateway_events_parse_rejected_total Count of gateway events rejected during parsing by scope and reason\n",
    );
    output.push_str("# TYPE courier_gateway_events_parse_rejected_total counter\n");
    let mut parse_rejected_entries: Vec<_> = snapshot(&state.gateway_events_parse_rejected)
        .into_iter()
        .collect();
    parse_rejected_entries.sort();
    for ((scope, reason), value) in parse_rejected_entries {
        let _ = writeln!(
            output,
            "courier_gateway_events_parse_rejected_total{{scope=\"{scope}\",reason=\"{reason}\"}} {value}"
        );
    }

    write_single_label_family(
        &mut output,
        "courier_offline_appends_total",
        "Count of events written to offline queues by kind",
        "kind",
        snapshot(&state.offline_appends),
    );
    write_single_label_family(
        &mut output,
        "courier_offline_drained_total",
        "Count of queued events delivered on drain by kind",
        "kind",
        snapshot(&state.offline_drained),
    );
    write_single_label_family(
        &mut output,
        "courier_store_faults_total",
        "Count of registry store failures by operation",
        "operation",
        snapshot(&state.store_faults),
    );

    output
}

fn bump(counters: &Mutex<HashMap<&'static str, u64>>, key: &'static str, by: u64) {
    if let Ok(mut counters) = counters.lock() {
        let entry = counters.entry(key).or_insert(0);
        *entry += by;
    }
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    bump(&metrics_state().auth_failures, reason, 1);
}

pub(crate) fn record_token_rotation(surface: &'static str) {
    bump(&metrics_state().token_rotations, surface, 1);
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    bump(&metrics_state().ws_disconnects, reason, 1);
}

pub(crate) fn record_offline_append(kind: &'static str) {
    bump(&metrics_state().offline_appends, kind, 1);
}

pub(crate) fn record_offline_drained(kind: &'static str, count: usize) {
    bump(
        &metrics_state().offline_drained,
        kind,
        u64::try_from(count).unwrap_or(u64::MAX),
    );
}

pub(crate) fn record_store_fault(operation: &'static str) {
    bump(&metrics_state().store_faults, operation, 1);
}

pub(crate) fn record_gateway_event_emitted(scope: &str, event_type: &str) {
    if let Ok(mut counters) = metrics_state().gateway_events_emitted.lock() {
        let entry = counters
            .entry((scope.to_owned(), event_type.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_dropped(scope: &str, event_type: &str, reason: &str) {
    if let Ok(mut counters) = metrics_state().gateway_events_dropped.lock() {
        let entry = counters
            .entry((scope.to_owned(), event_type.to_owned(), reason.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_unknown_received(scope: &str, event_type: &str) {
    if let Ok(mut counters) = metrics_state().gateway_events_unknown_received.lock() {
        let entry = counters
            .entry((scope.to_owned(), event_type.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

pub(crate) fn record_gateway_event_parse_rejected(scope: &str, reason: &str) {
    if let Ok(mut counters) = metrics_state().gateway_events_parse_rejected.lock() {
        let entry = counters
            .entry((scope.to_owned(), reason.to_owned()))
            .or_insert(0);
        *entry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        metrics_state, record_gateway_event_dropped, record_offline_drained, render_metrics,
    };

    #[test]
    fn renders_help_and_type_lines_for_every_family() {
        let rendered = render_metrics();
        for family in [
            "courier_auth_failures_total",
            "courier_token_rotations_total",
            "courier_ws_disconnects_total",
            "courier_gateway_events_emitted_total",
            "courier_gateway_events_dropped_total",
            "courier_gateway_events_unknown_received_total",
            "courier_gateway_events_parse_rejected_total",
            "courier_offline_appends_total",
            "courier_offline_drained_total",
            "courier_store_faults_total",
        ] {
            assert!(rendered.contains(&format!("# HELP {family} ")), "{family}");
            assert!(
                rendered.contains(&format!("# TYPE {family} counter")),
                "{family}"
            );
        }
    }

    #[test]
    fn drained_counts_accumulate_by_batch_size() {
        let before = metrics_state()
            .offline_drained
            .lock()
            .expect("offline drained mutex should not be poisoned")
            .get("metrics_test_kind")
            .copied()
            .unwrap_or(0);

        record_offline_drained("metrics_test_kind", 3);
        record_offline_drained("metrics_test_kind", 2);

        let after = metrics_state()
            .offline_drained
            .lock()
            .expect("offline drained mutex should not be poisoned")
            .get("metrics_test_kind")
            .copied()
            .unwrap_or(0);
        assert_eq!(after - before, 5);
    }

    #[test]
    fn dropped_events_render_with_all_labels() {
        record_gateway_event_dropped("user", "metrics_test_event", "full_queue");
        let rendered = render_metrics();
        assert!(rendered.contains(
            "courier_gateway_events_dropped_total{scope=\"user\",event_type=\"metrics_test_event\",reason=\"full_queue\"}"
        ));
    }
}
