use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{Method, Request, Response, StatusCode};
use ghsync_service::metric;
use tower_layer::Layer;
use tower_service::Service;

/// Records duration and status code of every request.
#[derive(Clone, Debug)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MetricsService { service }
    }
}

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    service: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        MetricsFuture {
            start: Instant::now(),
            method: request.method().clone(),
            future: self.service.call(request),
        }
    }
}

pub struct MetricsFuture<F> {
    start: Instant,
    method: Method,
    future: F,
}

impl<F, B, E> Future for MetricsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // SAFETY: `future` is structurally pinned, it is never moved out of `self`.
        let this = unsafe { self.get_unchecked_mut() };
        let future = unsafe { Pin::new_unchecked(&mut this.future) };

        let poll = future.poll(cx);
        if let Poll::Ready(ref result) = poll {
            let status = result
                .as_ref()
                .map(|response| response.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            metric!(
                timer("requests.duration") = this.start.elapsed(),
                "method" => this.method.as_str(),
            );
            metric!(
                counter("responses.status_code") += 1,
                "status" => status.as_str(),
                "method" => this.method.as_str(),
            );
        }
        poll
    }
}
