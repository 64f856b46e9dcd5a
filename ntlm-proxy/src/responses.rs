use rama_core::bytes::Bytes;
use rama_core::error::BoxError;
use rama_core::error::OpaqueError;
use rama_http::Body;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use serde::Serialize;
use tracing::error;

pub(crate) fn text_response(status: StatusCode, body: &str) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| Response::new(Body::from(body.to_string())))
}

pub(crate) fn json_response<T: Serialize>(value: &T) -> Response {
    let body = match serde_json::to_string(value) {
        Ok(body) => body,
        Err(err) => {
            error!("failed to serialize JSON response: {err}");
            "{}".to_string()
        }
    };
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|err| {
            error!("failed to build JSON response: {err}");
            Response::new(Body::from("{}"))
        })
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub(crate) fn json_error(status: StatusCode, message: &str) -> Response {
    let mut resp = json_response(&ErrorBody { error: message });
    *resp.status_mut() = status;
    resp
}

/// Response whose body errors immediately, making the HTTP server abort the
/// downstream connection without a complete exchange. Used on the direct path
/// when the origin socket dies mid-exchange: the client observes the failure
/// as a dropped connection rather than a synthesized gateway status.
pub(crate) fn downstream_abort_response(reason: &str) -> Response {
    let reason = reason.to_string();
    let stream = rama_core::futures::stream::once(async move {
        Err::<Bytes, BoxError>(OpaqueError::from_display(reason).into_boxed())
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONNECTION, "close")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn json_error_carries_status_and_message() {
        let resp = json_error(StatusCode::BAD_REQUEST, "bad config");

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn text_response_sets_plain_content_type() {
        let resp = text_response(StatusCode::NOT_FOUND, "not found");

        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    }

    #[test]
    fn downstream_abort_response_requests_connection_close() {
        let resp = downstream_abort_response("origin went away");

        assert_eq!(resp.headers().get(header::CONNECTION).unwrap(), "close");
    }
}
