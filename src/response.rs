use crate::schemas::Error;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE},
    Response, StatusCode,
};

pub(crate) type Body = BoxBody<Bytes, hyper::Error>;

pub(crate) fn json(status: StatusCode, value: &impl serde::Serialize) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let len = bytes.len();
            let mut response = Response::new(full(bytes));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response.headers_mut().insert(CONTENT_LENGTH, len.into());
            response
        }
        Err(_) => {
            let mut response = Response::new(full(Vec::new()));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[inline]
pub(crate) fn error(e: Error) -> Response<Body> {
    json(e.status(), &e.body())
}

fn full(bytes: Vec<u8>) -> Body {
    Full::new(Bytes::from(bytes))
        .map_err(|never| match never {})
        .boxed()
}
