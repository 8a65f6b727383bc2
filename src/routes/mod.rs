pub mod calls;
pub mod devices;
pub mod messages;
pub mod wsroute;

use crate::metrics;
use actix_web::web;

/// Register every route of the service.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(messages::send_message)
        .service(messages::recall_message)
        .service(messages::mark_read)
        .service(messages::drain_offline)
        .service(messages::unread_count)
        .service(calls::initiate_call)
        .service(calls::get_call)
        .service(calls::accept_call)
        .service(calls::reject_call)
        .service(calls::end_call)
        .service(devices::list_devices)
        .service(devices::kick_device)
        .service(wsroute::ws_handler)
        .route("/health", web::get().to(|| async { "OK" }))
        .route("/metrics", web::get().to(metrics::metrics_handler));
}
