use actix_web::middleware::Next;
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    Error,
};
use std::time::{Duration, Instant};

/// Requests slower than this are logged at warn
const SLOW_REQUEST: Duration = Duration::from_secs(5);

/// Log method, path, status and latency of every request
pub async fn request_logger(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let start = Instant::now();
    let method = req.method().to_string();
    let path = req.path().to_string();
    let remote_addr = req
        .connection_info()
        .realip_remote_addr()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());

    tracing::debug!("--> {} {} (from: {})", method, path, remote_addr);

    let res = next.call(req).await?;

    let elapsed = start.elapsed();
    let status = res.status();

    if status.is_server_error() {
        tracing::error!("<-- {} {} {} ({}ms)", method, path, status.as_u16(), elapsed.as_millis());
    } else if status.is_client_error() || elapsed > SLOW_REQUEST {
        tracing::warn!("<-- {} {} {} ({}ms)", method, path, status.as_u16(), elapsed.as_millis());
    } else {
        tracing::info!("<-- {} {} {} ({}ms)", method, path, status.as_u16(), elapsed.as_millis());
    }

    Ok(res)
}
