use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C, name: &str) -> C {
    prometheus::default_registry()
        .register(Box::new(collector.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    collector
}

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_delivery_http_requests_total",
            "Total HTTP requests handled by realtime-delivery-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create realtime_delivery_http_requests_total");
    register(counter, "realtime_delivery_http_requests_total")
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "realtime_delivery_http_request_duration_seconds",
            "HTTP request latency for realtime-delivery-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create realtime_delivery_http_request_duration_seconds");
    register(histogram, "realtime_delivery_http_request_duration_seconds")
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "realtime_delivery_active_connections",
        "Registry entries currently held by this instance",
    )
    .expect("failed to create realtime_delivery_active_connections");
    register(gauge, "realtime_delivery_active_connections")
});

pub static FRAMES_DELIVERED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_delivery_frames_delivered_total",
            "Frames enqueued to local connections",
        ),
        &["kind"],
    )
    .expect("failed to create realtime_delivery_frames_delivered_total");
    register(counter, "realtime_delivery_frames_delivered_total")
});

pub static SLOW_CONSUMERS_DROPPED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_delivery_slow_consumers_dropped_total",
        "Connections force-closed because their outbound buffer was full",
    )
    .expect("failed to create realtime_delivery_slow_consumers_dropped_total");
    register(counter, "realtime_delivery_slow_consumers_dropped_total")
});

pub static FANOUT_PUBLISH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_delivery_fanout_publish_failures_total",
        "Events that reached local connections but not the backbone",
    )
    .expect("failed to create realtime_delivery_fanout_publish_failures_total");
    register(counter, "realtime_delivery_fanout_publish_failures_total")
});

pub static FANOUT_EVENTS_RECEIVED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_delivery_fanout_events_received_total",
            "Backbone events received, by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create realtime_delivery_fanout_events_received_total");
    register(counter, "realtime_delivery_fanout_events_received_total")
});

pub static BRIDGE_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "realtime_delivery_bridge_reconnects_total",
        "Backbone subscription reconnects",
    )
    .expect("failed to create realtime_delivery_bridge_reconnects_total");
    register(counter, "realtime_delivery_bridge_reconnects_total")
});

pub static RATE_LIMIT_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_delivery_rate_limit_rejections_total",
            "Requests rejected by the rate limiter",
        ),
        &["surface"],
    )
    .expect("failed to create realtime_delivery_rate_limit_rejections_total");
    register(counter, "realtime_delivery_rate_limit_rejections_total")
});

pub static PRESENCE_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "realtime_delivery_presence_transitions_total",
            "Presence status transitions on this instance",
        ),
        &["to"],
    )
    .expect("failed to create realtime_delivery_presence_transitions_total");
    register(counter, "realtime_delivery_presence_transitions_total")
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub async fn serve_metrics() -> HttpResponse {
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

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::time::Instant;

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = MetricsMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let start = Instant::now();
        let method = req.method().to_string();
        // Route template keeps label cardinality bounded.
        let path = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());

        Box::pin(async move {
            let res = service.call(req).await?;
            observe_http_request(&method, &path, res.status().as_u16(), start.elapsed());
            Ok(res)
        })
    }
}
