//! Server-side request routing (spec §4.4, §9): `method` maps to an
//! ordered list of handlers (middleware chain). Each handler may send a
//! reply, send an error, or call `next()` by returning
//! `Outcome::Next`; if the chain is exhausted with nothing sent, the
//! router auto-sends `{status:"ok"}`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::wire::{Request, Response};
use crate::error::{Error, Result};

/// What a handler decided to do with the request.
pub enum Outcome {
    /// A reply or error was set on `res`; stop the chain.
    Handled,
    /// Defer to the next handler in the chain.
    Next,
}

/// Accumulates the reply a handler chain is building, so a handler can
/// "send a reply" or "send an error" without owning the transport
/// itself (spec §4.4, §9).
#[derive(Default)]
pub struct ResponseBuilder {
    response: Option<Response>,
}

impl ResponseBuilder {
    pub fn ok(&mut self, id: String, result: impl serde::Serialize) -> Result<()> {
        self.response = Some(Response::ok(id, result, Utc::now().timestamp())?);
        Ok(())
    }

    pub fn error(&mut self, id: String, error: crate::error::ErrorData) {
        self.response = Some(Response::err(id, error, Utc::now().timestamp()));
    }

    pub fn is_set(&self) -> bool {
        self.response.is_some()
    }
}

/// One handler in a method's middleware chain (spec §4.4: "a router
/// maps method -> ordered list of handlers"). `Ctx` is the owning
/// peer's protocol state (`Forge` or `Pocket`), `sender` is the
/// envelope's verified sender pubkey (hex).
#[async_trait]
pub trait Handler<Ctx>: Send + Sync {
    async fn call(
        &self,
        req: &Request,
        sender: &str,
        ctx: &Ctx,
        res: &mut ResponseBuilder,
    ) -> Result<Outcome>;
}

/// `method -> ordered handler chain` (spec §4.4).
pub struct Router<Ctx> {
    routes: HashMap<String, Vec<Arc<dyn Handler<Ctx>>>>,
}

impl<Ctx> Router<Ctx> {
    pub fn new() -> Self {
        Router {
            routes: HashMap::new(),
        }
    }

    pub fn register(&mut self, method: impl Into<String>, handlers: Vec<Arc<dyn Handler<Ctx>>>) {
        self.routes.insert(method.into(), handlers);
    }

    /// Runs the chain registered for `req.method`; a handler that
    /// throws is translated to `Internal` per spec §7 "handler-thrown
    /// exceptions translate to Internal" — in Rust this is any `Err`
    /// bubbling out of a handler's `call`.
    pub async fn dispatch(&self, req: &Request, sender: &str, ctx: &Ctx) -> Response {
        let chain = match self.routes.get(&req.method) {
            Some(chain) => chain,
            None => {
                return Response::err(
                    req.id.clone(),
                    Error::MethodNotFound(req.method.clone()).to_wire(),
                    Utc::now().timestamp(),
                )
            }
        };

        let mut builder = ResponseBuilder::default();
        for handler in chain {
            match handler.call(req, sender, ctx, &mut builder).await {
                Ok(Outcome::Handled) => break,
                Ok(Outcome::Next) => continue,
                Err(e) => {
                    builder.error(req.id.clone(), e.to_wire());
                    break;
                }
            }
        }

        builder
            .response
            .unwrap_or_else(|| Response::default_ok(req.id.clone(), Utc::now().timestamp()))
    }
}

impl<Ctx> Default for Router<Ctx> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    struct AlwaysForbidden;

    #[async_trait]
    impl Handler<()> for Echo {
        async fn call(
            &self,
            req: &Request,
            _sender: &str,
            _ctx: &(),
            res: &mut ResponseBuilder,
        ) -> Result<Outcome> {
            res.ok(req.id.clone(), serde_json::json!({"message": "pong"}))?;
            Ok(Outcome::Handled)
        }
    }

    #[async_trait]
    impl Handler<()> for AlwaysForbidden {
        async fn call(
            &self,
            req: &Request,
            _sender: &str,
            _ctx: &(),
            res: &mut ResponseBuilder,
        ) -> Result<Outcome> {
            res.error(req.id.clone(), Error::Forbidden.to_wire());
            Ok(Outcome::Handled)
        }
    }

    #[tokio::test]
    async fn unregistered_method_is_404() {
        let router: Router<()> = Router::new();
        let req = Request::new("1".into(), "ping", &serde_json::json!({}), 0).unwrap();
        let res = router.dispatch(&req, "sender", &()).await;
        assert_eq!(res.error.unwrap().code, 404);
    }

    #[tokio::test]
    async fn chain_exhaustion_sends_default_ok() {
        let mut router: Router<()> = Router::new();
        router.register("ping", vec![]);
        let req = Request::new("1".into(), "ping", &serde_json::json!({}), 0).unwrap();
        let res = router.dispatch(&req, "sender", &()).await;
        assert_eq!(res.result.unwrap()["status"], "ok");
    }

    #[tokio::test]
    async fn first_handled_short_circuits_chain() {
        let mut router: Router<()> = Router::new();
        router.register("forge", vec![Arc::new(AlwaysForbidden), Arc::new(Echo)]);
        let req = Request::new("1".into(), "forge", &serde_json::json!({}), 0).unwrap();
        let res = router.dispatch(&req, "sender", &()).await;
        assert_eq!(res.error.unwrap().code, 403);
    }
}
