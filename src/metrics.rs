use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C, name: &str) -> C {
    // Tests build several app instances in one process; a second
    // registration of the same name is harmless there.
    if let Err(err) = prometheus::default_registry().register(Box::new(collector.clone())) {
        tracing::debug!(metric = name, error = %err, "metric already registered");
    }
    collector
}

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("active_sessions", "Connected WebSocket sessions on this instance")
        .expect("failed to create active_sessions");
    register(gauge, "active_sessions")
});

pub static SESSION_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "session_evictions_total",
        "Sessions force-closed because the same device connected again",
    )
    .expect("failed to create session_evictions_total");
    register(counter, "session_evictions_total")
});

pub static RATE_LIMITED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("rate_limited_total", "Operations denied by the rate limiter"),
        &["dimension"],
    )
    .expect("failed to create rate_limited_total");
    register(counter, "rate_limited_total")
});

pub static FANOUT_LIVE_DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "fanout_live_deliveries_total",
            "Recipients reached on a live connection",
        ),
        &["receiver_kind"],
    )
    .expect("failed to create fanout_live_deliveries_total");
    register(counter, "fanout_live_deliveries_total")
});

pub static FANOUT_OFFLINE_ENQUEUED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "fanout_offline_enqueued_total",
            "Recipients whose message was parked in the offline queue",
        ),
        &["receiver_kind"],
    )
    .expect("failed to create fanout_offline_enqueued_total");
    register(counter, "fanout_offline_enqueued_total")
});

pub static FANOUT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "fanout_failures_total",
        "Per-recipient delivery failures",
    )
    .expect("failed to create fanout_failures_total");
    register(counter, "fanout_failures_total")
});

pub static MESSAGES_PURGED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "messages_purged_total",
        "Messages deleted by the retention sweep",
    )
    .expect("failed to create messages_purged_total");
    register(counter, "messages_purged_total")
});

pub static OUTBOUND_OVERFLOW_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "outbound_overflow_total",
        "Sessions disconnected because their outbound queue was full",
    )
    .expect("failed to create outbound_overflow_total");
    register(counter, "outbound_overflow_total")
});

pub static PUSH_NOTIFICATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("push_notifications_total", "Push notification attempts"),
        &["outcome"],
    )
    .expect("failed to create push_notifications_total");
    register(counter, "push_notifications_total")
});

pub static DISPATCH_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "dispatch_queue_depth",
        "Dispatch jobs waiting for a worker",
    )
    .expect("failed to create dispatch_queue_depth");
    register(gauge, "dispatch_queue_depth")
});

pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
