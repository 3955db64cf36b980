//! Calculator tools — one listener per operation, with per-thread memory.
//!
//! Each operation keeps the last result in its listener-scoped storage
//! slot, keyed by thread. A request that omits `<b>` uses the remembered
//! value, so agents can chain operations without restating intermediate
//! results. Memory dies with the thread.

use async_trait::async_trait;

use crate::handler::{
    Handler, HandlerContext, HandlerFailure, HandlerResponse, HandlerResult, ValidatedPayload,
};
use crate::registry::ScopedStorage;
use crate::schema::{FieldKind, FieldSpec, PayloadSchema};

use super::{render_number, result_payload};

pub const CALCULATOR_NS: &str = "https://xml-pipeline.org/ns/calculator/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalcOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl CalcOp {
    pub fn root_tag(&self) -> &'static str {
        match self {
            CalcOp::Add => "add",
            CalcOp::Sub => "sub",
            CalcOp::Mul => "mul",
            CalcOp::Div => "div",
        }
    }

    pub fn listener_name(&self) -> String {
        format!("calculator.{}", self.root_tag())
    }

    pub fn describe(&self) -> String {
        let verb = match self {
            CalcOp::Add => "Add two numbers",
            CalcOp::Sub => "Subtract b from a",
            CalcOp::Mul => "Multiply two numbers",
            CalcOp::Div => "Divide a by b",
        };
        format!("{verb}; omit <b> to reuse the last result in this thread")
    }

    fn apply(&self, a: f64, b: f64) -> Result<f64, String> {
        match self {
            CalcOp::Add => Ok(a + b),
            CalcOp::Sub => Ok(a - b),
            CalcOp::Mul => Ok(a * b),
            CalcOp::Div => {
                if b == 0.0 {
                    Err("division by zero".into())
                } else {
                    Ok(a / b)
                }
            }
        }
    }
}

/// Payload contract shared by all four operations.
pub fn schema(op: CalcOp) -> PayloadSchema {
    PayloadSchema::new(op.root_tag())
        .with_namespace(CALCULATOR_NS)
        .with_field(FieldSpec::required("a", FieldKind::Float))
        .with_field(FieldSpec::optional("b", FieldKind::Float))
}

pub struct CalculatorTool {
    op: CalcOp,
    memory: ScopedStorage,
}

impl CalculatorTool {
    pub fn new(op: CalcOp, memory: ScopedStorage) -> Self {
        Self { op, memory }
    }
}

#[async_trait]
impl Handler for CalculatorTool {
    async fn handle(&self, payload: ValidatedPayload, ctx: HandlerContext) -> HandlerResult {
        let a = payload
            .value
            .float("a")
            .ok_or_else(|| HandlerFailure::Failed("missing <a>".into()))?;

        let b = match payload.value.float("b") {
            Some(b) => b,
            None => self
                .memory
                .get(&ctx.thread_id)
                .and_then(|m| m.parse::<f64>().ok())
                .ok_or_else(|| {
                    HandlerFailure::Failed(
                        "no <b> given and no remembered result in this thread".into(),
                    )
                })?,
        };

        let result = self.op.apply(a, b).map_err(HandlerFailure::Failed)?;
        self.memory.put(&ctx.thread_id, result.to_string());
        Ok(HandlerResponse::Reply(result_payload(&render_number(result))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ListenerRegistry;
    use crate::schema::{CompiledSchema, PayloadValue, Value};

    fn ctx(thread: &str) -> HandlerContext {
        HandlerContext {
            thread_id: thread.into(),
            from: "researcher".into(),
            own_name: "calculator.add".into(),
        }
    }

    fn payload(op: CalcOp, a: f64, b: Option<f64>) -> ValidatedPayload {
        let mut value = PayloadValue {
            tag: op.root_tag().into(),
            fields: Default::default(),
        };
        value.fields.insert("a".into(), Value::Float(a));
        if let Some(b) = b {
            value.fields.insert("b".into(), Value::Float(b));
        }
        ValidatedPayload {
            tag: op.root_tag().into(),
            xml: Vec::new(),
            value,
        }
    }

    fn reply_text(result: HandlerResult) -> String {
        match result.unwrap() {
            HandlerResponse::Reply(bytes) => String::from_utf8(bytes).unwrap(),
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn add_forty_plus_two() {
        let registry = ListenerRegistry::new();
        let tool = CalculatorTool::new(CalcOp::Add, registry.scoped_storage("calculator.add"));
        let out = reply_text(tool.handle(payload(CalcOp::Add, 40.0, Some(2.0)), ctx("t1")).await);
        assert_eq!(out, "<result>42</result>");
    }

    #[tokio::test]
    async fn memory_chains_within_thread() {
        let registry = ListenerRegistry::new();
        let tool = CalculatorTool::new(CalcOp::Add, registry.scoped_storage("calculator.add"));

        reply_text(tool.handle(payload(CalcOp::Add, 40.0, Some(2.0)), ctx("t1")).await);
        // Omitting b reuses the remembered 42.
        let out = reply_text(tool.handle(payload(CalcOp::Add, 8.0, None), ctx("t1")).await);
        assert_eq!(out, "<result>50</result>");
    }

    #[tokio::test]
    async fn memory_is_thread_scoped() {
        let registry = ListenerRegistry::new();
        let tool = CalculatorTool::new(CalcOp::Add, registry.scoped_storage("calculator.add"));

        reply_text(tool.handle(payload(CalcOp::Add, 1.0, Some(1.0)), ctx("t1")).await);
        let err = tool
            .handle(payload(CalcOp::Add, 1.0, None), ctx("t2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no remembered result"));
    }

    #[tokio::test]
    async fn memory_cleared_with_thread() {
        let registry = ListenerRegistry::new();
        let tool = CalculatorTool::new(CalcOp::Add, registry.scoped_storage("calculator.add"));

        reply_text(tool.handle(payload(CalcOp::Add, 1.0, Some(2.0)), ctx("t1")).await);
        registry.storage().clear_thread("t1");
        assert!(tool
            .handle(payload(CalcOp::Add, 1.0, None), ctx("t1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn division_by_zero_fails() {
        let registry = ListenerRegistry::new();
        let tool = CalculatorTool::new(CalcOp::Div, registry.scoped_storage("calculator.div"));
        let err = tool
            .handle(payload(CalcOp::Div, 1.0, Some(0.0)), ctx("t1"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn schema_validates_the_wire_shape() {
        let compiled = CompiledSchema::compile(schema(CalcOp::Add));
        let good = crate::xml::repair::parse(b"<add><a>40</a><b>2</b></add>").unwrap();
        assert!(compiled.validate(&good).is_ok());

        let bad = crate::xml::repair::parse(b"<add><a>forty</a><b>2</b></add>").unwrap();
        assert!(compiled.validate(&bad).is_err());
    }
}
