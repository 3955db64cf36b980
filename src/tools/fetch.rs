//! Fetch tool — bounded HTTP GET.

use async_trait::async_trait;

use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::schema::{FieldKind, FieldSpec, PayloadSchema};
use crate::xml::{canon, Element};

pub const FETCH_NS: &str = "https://xml-pipeline.org/ns/fetch/v1";

/// Hard ceiling regardless of what the payload asks for.
const MAX_FETCH_BYTES: usize = 256 * 1024;

pub fn schema() -> PayloadSchema {
    PayloadSchema::new("fetch")
        .with_namespace(FETCH_NS)
        .with_field(FieldSpec::required("url", FieldKind::Text))
        .with_field(FieldSpec::optional("limit", FieldKind::Int))
}

pub struct FetchTool {
    http: reqwest::Client,
}

impl FetchTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for FetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for FetchTool {
    async fn handle(&self, payload: ValidatedPayload, _ctx: HandlerContext) -> HandlerResult {
        let url = payload
            .value
            .text("url")
            .ok_or_else(|| HandlerFailure::Failed("missing <url>".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(HandlerFailure::Failed(format!(
                "unsupported URL scheme: {url}"
            )));
        }
        let limit = payload
            .value
            .int("limit")
            .map(|l| l.clamp(1, MAX_FETCH_BYTES as i64) as usize)
            .unwrap_or(MAX_FETCH_BYTES);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| HandlerFailure::Failed(format!("fetch failed: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| HandlerFailure::Failed(format!("read failed: {e}")))?;

        let truncated = body.len() > limit;
        let slice = &body[..body.len().min(limit)];
        let text = String::from_utf8_lossy(slice);

        let mut result = Element::new("fetch-result")
            .with_attr("xmlns", FETCH_NS)
            .with_attr("status", &status.to_string())
            .with_attr("bytes", &slice.len().to_string());
        if truncated {
            result.set_attr("truncated", "true");
        }
        result.children.push(crate::xml::Node::Text(text.into_owned()));

        Ok(HandlerResponse::Reply(canon::to_bytes(&result)))
    }
}
