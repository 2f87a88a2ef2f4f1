use async_stream::stream;
use futures_util::StreamExt;
use hyper::client::HttpConnector;
use hyper::{header, Body, Client, Method, Request, Uri};
use tokio_util::sync::CancellationToken;

use super::event_stream::EventStreamDecoder;
use super::{ChunkStream, CompletionRequest, CompletionTransport, TransportError};
use log::{debug, info, warn};

/// Streams completions from a llama.cpp `server` over plain HTTP.
#[derive(Debug, Clone)]
pub struct LlamaServerTransport {
    client: Client<HttpConnector>,
    completion_uri: Uri,
}

impl LlamaServerTransport {
    pub fn new(server_url: &str) -> Result<Self, TransportError> {
        let base = server_url.trim_end_matches('/');
        let completion_uri: Uri =
            format!("{base}/completion")
                .parse()
                .map_err(|e: hyper::http::uri::InvalidUri| TransportError::InvalidUrl {
                    url: server_url.to_string(),
                    reason: e.to_string(),
                })?;

        match completion_uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(TransportError::InvalidUrl {
                    url: server_url.to_string(),
                    reason: format!("unsupported scheme {other:?}, expected http"),
                })
            }
        }

        info!("Completion endpoint: {completion_uri}");
        Ok(Self {
            client: Client::new(),
            completion_uri,
        })
    }

    pub fn completion_uri(&self) -> &Uri {
        &self.completion_uri
    }

    fn build_request(&self, request: &CompletionRequest) -> Result<Request<Body>, TransportError> {
        let body = serde_json::to_vec(&request.to_payload())?;
        Ok(Request::builder()
            .method(Method::POST)
            .uri(self.completion_uri.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "text/event-stream")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from(body))?)
    }
}

impl CompletionTransport for LlamaServerTransport {
    fn stream_completion(&self, request: CompletionRequest, cancel: CancellationToken) -> ChunkStream {
        let client = self.client.clone();
        let built = self.build_request(&request);

        Box::pin(stream! {
            let http_request = match built {
                Ok(r) => r,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            debug!("POST {} ({} chars of prompt)", http_request.uri(), request.prompt.len());
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Completion cancelled while connecting");
                    return;
                }
                res = client.request(http_request) => res,
            };
            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!("Completion request failed: {e}");
                    yield Err(TransportError::Http(e));
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = match hyper::body::to_bytes(response.into_body()).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) => e.to_string(),
                };
                warn!("Completion server answered {status}: {body}");
                yield Err(TransportError::Status { status: status.as_u16(), body });
                return;
            }

            let mut body = response.into_body();
            let mut decoder = EventStreamDecoder::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Completion cancelled while streaming");
                        return;
                    }
                    next = body.next() => next,
                };
                let bytes = match next {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        yield Err(TransportError::Http(e));
                        return;
                    }
                    None => break,
                };

                for event in decoder.push(&bytes) {
                    match event {
                        Ok(chunk) => {
                            let last = chunk.stop;
                            yield Ok(chunk);
                            if last {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }

            if decoder.pending_len() > 0 {
                debug!("Dropping {} bytes of unterminated event data", decoder.pending_len());
            }
        })
    }
}
