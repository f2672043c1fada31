use anyhow::Context;
use axum::body::Body;
use axum::extract;
use axum::http::{HeaderMap, Method, Response, StatusCode, header};
use serde::Deserialize;
use symproxy_service::compression::accepts_gzip;
use symproxy_service::service::{Resolution, SymbolService};
use tokio_util::io::ReaderStream;

use super::ResponseError;

/// Path components of a symbol request, exactly as sent by the client.
#[derive(Debug, Deserialize)]
pub struct SymbolPath {
    module_name: String,
    identifier: String,
    file_name: String,
}

fn wants_gzip(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(accepts_gzip)
}

pub async fn get_symbol(
    extract::State(service): extract::State<SymbolService>,
    extract::Path(path): extract::Path<SymbolPath>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response<Body>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /symbol"));
    });

    let resolution = service
        .resolve(
            &path.module_name,
            &path.identifier,
            &path.file_name,
            wants_gzip(&headers),
        )
        .await?;

    let body = match resolution {
        Resolution::Hit(body) => body,
        Resolution::Miss => {
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::empty())?);
        }
        Resolution::Invalid(err) => return Err(err.into()),
        Resolution::UpstreamFailure(error) => {
            let err = anyhow::anyhow!(error).context("symbol download failed, retrying");
            return Err((StatusCode::SERVICE_UNAVAILABLE, err).into());
        }
    };

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, body.size)
        .header(header::VARY, "accept-encoding");
    if let Some(encoding) = body.encoding.header_value() {
        response = response.header(header::CONTENT_ENCODING, encoding);
    }

    if method == Method::HEAD {
        return Ok(response.body(Body::empty())?);
    }

    let file = body.open().await.context("failed to open cached symbol")?;
    Ok(response.body(Body::from_stream(ReaderStream::new(file)))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wants_gzip() {
        let mut headers = HeaderMap::new();
        assert!(!wants_gzip(&headers));

        headers.append(header::ACCEPT_ENCODING, "br".parse().unwrap());
        assert!(!wants_gzip(&headers));

        headers.append(header::ACCEPT_ENCODING, "gzip;q=0.8".parse().unwrap());
        assert!(wants_gzip(&headers));
    }
}
