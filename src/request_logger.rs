use rocket::fairing::{Fairing, Info, Kind};
use rocket::{Data, Request, Response};
use std::time::Instant;

/// Fairing that logs one line per HTTP request with timing.
pub struct RequestLogger;

#[rocket::async_trait]
impl Fairing for RequestLogger {
    fn info(&self) -> Info {
        Info {
            name: "Request Logger",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, request: &mut Request<'_>, _: &mut Data<'_>) {
        request.local_cache(Instant::now);
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let duration = request.local_cache(Instant::now).elapsed();

        // Snapshot uploads can be large; surface their size next to the timing.
        let body = request
            .headers()
            .get_one("Content-Length")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|length| *length > 0)
            .map(|length| format!(" [{} bytes in]", length))
            .unwrap_or_default();

        log::info!(
            "{} {} -> {} ({:.2}ms){}",
            request.method(),
            request.uri(),
            response.status().code,
            duration.as_secs_f64() * 1000.0,
            body
        );
    }
}
