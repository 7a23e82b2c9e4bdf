use std::time::Duration;

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "order_notification_http_requests_total",
            "Total HTTP requests handled by order-notification-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create order_notification_http_requests_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register order_notification_http_requests_total");
    counter
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "order_notification_http_request_duration_seconds",
            "HTTP request latency for order-notification-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create order_notification_http_request_duration_seconds");
    prometheus::default_registry()
        .register(Box::new(histogram.clone()))
        .expect("failed to register order_notification_http_request_duration_seconds");
    histogram
});

static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "order_notification_active_connections",
        "WebSocket connections currently registered",
    )
    .expect("failed to create order_notification_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register order_notification_active_connections");
    gauge
});

static MESSAGES_DELIVERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "order_notification_messages_delivered_total",
            "Messages accepted into connection outbound queues",
        ),
        &["route"],
    )
    .expect("failed to create order_notification_messages_delivered_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register order_notification_messages_delivered_total");
    counter
});

static SLOW_CONSUMER_EVICTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "order_notification_slow_consumer_evictions_total",
        "Connections dropped because their outbound queue was full or closed",
    )
    .expect("failed to create order_notification_slow_consumer_evictions_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register order_notification_slow_consumer_evictions_total");
    counter
});

static ORDERS_COMPLETED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "order_notification_orders_completed_total",
        "Order completions detected on the change feed",
    )
    .expect("failed to create order_notification_orders_completed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register order_notification_orders_completed_total");
    counter
});

static NOTIFIED_WRITE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "order_notification_notified_write_failures_total",
        "notified_at write-backs that failed after all retries",
    )
    .expect("failed to create order_notification_notified_write_failures_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register order_notification_notified_write_failures_total");
    counter
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

pub fn set_active_connections(count: usize) {
    ACTIVE_CONNECTIONS.set(count as i64);
}

pub fn record_delivered(route: &str, count: usize) {
    if count > 0 {
        MESSAGES_DELIVERED_TOTAL
            .with_label_values(&[route])
            .inc_by(count as u64);
    }
}

pub fn record_slow_consumer_eviction() {
    SLOW_CONSUMER_EVICTIONS_TOTAL.inc();
}

pub fn record_order_completed() {
    ORDERS_COMPLETED_TOTAL.inc();
}

pub fn record_notified_write_failure() {
    NOTIFIED_WRITE_FAILURES_TOTAL.inc();
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

/// Records request metrics and logs every non-2xx outcome.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
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
        let path = req.path().to_string();
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            let status = match &result {
                Ok(response) => response.status().as_u16(),
                Err(_) => 500,
            };
            observe_http_request(&method, &path, status, elapsed);
            // 101 is a successful websocket upgrade.
            if !(200..300).contains(&status) && status != 101 {
                tracing::warn!(
                    method = %method,
                    path = %path,
                    status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Request completed with non-success status"
                );
            }
            result
        })
    }
}
