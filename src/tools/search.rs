//! Search tools — a broadcast group.
//!
//! `google` and `bing` register under the same `search` root tag, so a
//! plain `<search>` payload fans out to both and the results surface in
//! completion order. The backend is a trait; the builtin one is a
//! deterministic in-memory index.

use async_trait::async_trait;

use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::schema::{FieldKind, FieldSpec, PayloadSchema};
use crate::xml::{canon, Element};

pub const SEARCH_NS: &str = "https://xml-pipeline.org/ns/search/v1";

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
}

/// Where the hits come from.
pub trait SearchBackend: Send + Sync + 'static {
    fn engine(&self) -> &str;
    fn search(&self, query: &str) -> Vec<SearchHit>;
}

/// Deterministic keyword index.
pub struct StaticIndex {
    engine: String,
    entries: Vec<(String, SearchHit)>,
}

impl StaticIndex {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn with_entry(mut self, keyword: &str, title: &str, url: &str) -> Self {
        self.entries.push((
            keyword.to_lowercase(),
            SearchHit {
                title: title.to_string(),
                url: url.to_string(),
            },
        ));
        self
    }
}

impl SearchBackend for StaticIndex {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn search(&self, query: &str) -> Vec<SearchHit> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .filter(|(keyword, _)| query.contains(keyword.as_str()))
            .map(|(_, hit)| hit.clone())
            .collect()
    }
}

/// Payload contract for the `search` broadcast group.
pub fn schema() -> PayloadSchema {
    PayloadSchema::new("search")
        .with_namespace(SEARCH_NS)
        .with_field(FieldSpec::required("query", FieldKind::Text))
        .with_field(FieldSpec::optional("limit", FieldKind::Int))
}

pub struct SearchTool<B: SearchBackend> {
    backend: B,
}

impl<B: SearchBackend> SearchTool<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: SearchBackend> Handler for SearchTool<B> {
    async fn handle(&self, payload: ValidatedPayload, _ctx: HandlerContext) -> HandlerResult {
        let query = payload
            .value
            .text("query")
            .ok_or_else(|| HandlerFailure::Failed("missing <query>".into()))?;
        let limit = payload.value.int("limit").unwrap_or(10).max(0) as usize;

        let mut results = Element::new("search-results")
            .with_attr("xmlns", SEARCH_NS)
            .with_attr("engine", self.backend.engine());
        for hit in self.backend.search(query).into_iter().take(limit) {
            results.children.push(crate::xml::Node::Element(
                Element::new("hit")
                    .with_child(Element::new("title").with_text(&hit.title))
                    .with_child(Element::new("url").with_text(&hit.url)),
            ));
        }

        Ok(HandlerResponse::Reply(canon::to_bytes(&results)))
    }
}

/// Builtin engines with small fixed corpora (useful out of the box and in
/// integration tests).
pub fn google_stub() -> StaticIndex {
    StaticIndex::new("google")
        .with_entry("rust", "The Rust Programming Language", "https://www.rust-lang.org/")
        .with_entry("tokio", "Tokio — asynchronous Rust", "https://tokio.rs/")
        .with_entry("xml", "Extensible Markup Language", "https://www.w3.org/XML/")
}

pub fn bing_stub() -> StaticIndex {
    StaticIndex::new("bing")
        .with_entry("rust", "Rust (programming language)", "https://en.wikipedia.org/wiki/Rust_(programming_language)")
        .with_entry("xml", "XML tutorial", "https://www.w3schools.com/xml/")
}
