use async_trait::async_trait;
use serde_json::Value;

use medrelay_core::error::Result;
use medrelay_core::protocol::{Request, Response};

use crate::dispatch::BusinessHandler;
use crate::routing::Responder;

/// Echo request fields back as `data`. Useful to prove the routing path.
#[derive(Default)]
pub struct EchoService;

impl EchoService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BusinessHandler for EchoService {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn actions(&self) -> &'static [&'static str] {
        &["echo"]
    }

    async fn handle(&self, req: Request, responder: Responder) -> Result<()> {
        let resp = Response::ok(Response::kind_for(&req.action), Value::Object(req.fields));
        responder.reply(resp).await;
        Ok(())
    }
}
