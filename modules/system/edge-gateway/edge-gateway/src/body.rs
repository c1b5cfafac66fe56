use bytes::Bytes;
use http::Response;
use http_body_util::{BodyExt, Empty, Full};

use crate::error::BoxError;

/// Type-erased body of every response leaving the dispatch pipeline.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Buffered request body; buffering lets every retry replay the same bytes.
pub type RequestBody = Full<Bytes>;

pub fn full(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ResponseBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Box any upstream body into [`ResponseBody`].
pub(crate) fn boxed_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}
