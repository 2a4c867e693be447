//! Authorization middleware (spec §4.4: "middleware is the
//! authorization mechanism: `onlyAuthorized` consults the forge's
//! authorized-forgers set; `onlyOwner` checks the owner pubkey; both
//! return HTTP-style 403 on failure without calling `next`").

use async_trait::async_trait;

use super::router::{Handler, Outcome, ResponseBuilder};
use super::wire::Request;
use crate::error::{Error, Result};

/// What a protocol-state type must expose for the auth middleware to
/// gate on it, without coupling the middleware to `Forge` directly.
pub trait AuthGate {
    fn is_authorized_forger(&self, pubkey: &str) -> bool;
    fn is_owner(&self, pubkey: &str) -> bool;
}

pub struct OnlyAuthorized;

#[async_trait]
impl<Ctx: AuthGate + Send + Sync> Handler<Ctx> for OnlyAuthorized {
    async fn call(
        &self,
        req: &Request,
        sender: &str,
        ctx: &Ctx,
        res: &mut ResponseBuilder,
    ) -> Result<Outcome> {
        if ctx.is_authorized_forger(sender) {
            Ok(Outcome::Next)
        } else {
            res.error(req.id.clone(), Error::Forbidden.to_wire());
            Ok(Outcome::Handled)
        }
    }
}

pub struct OnlyOwner;

#[async_trait]
impl<Ctx: AuthGate + Send + Sync> Handler<Ctx> for OnlyOwner {
    async fn call(
        &self,
        req: &Request,
        sender: &str,
        ctx: &Ctx,
        res: &mut ResponseBuilder,
    ) -> Result<Outcome> {
        if ctx.is_owner(sender) {
            Ok(Outcome::Next)
        } else {
            res.error(req.id.clone(), Error::Forbidden.to_wire());
            Ok(Outcome::Handled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::router::Router;
    use std::sync::Arc;

    struct Gate {
        authorized: Vec<String>,
        owner: String,
    }

    impl AuthGate for Gate {
        fn is_authorized_forger(&self, pubkey: &str) -> bool {
            self.authorized.iter().any(|p| p == pubkey) || pubkey == self.owner
        }
        fn is_owner(&self, pubkey: &str) -> bool {
            pubkey == self.owner
        }
    }

    #[tokio::test]
    async fn non_authorized_caller_is_forbidden() {
        let gate = Gate {
            authorized: vec!["minter".into()],
            owner: "owner".into(),
        };
        let mut router: Router<Gate> = Router::new();
        router.register("forge", vec![Arc::new(OnlyAuthorized)]);
        let req = Request::new("1".into(), "forge", &serde_json::json!({}), 0).unwrap();

        let res = router.dispatch(&req, "stranger", &gate).await;
        assert_eq!(res.error.unwrap().code, 403);

        let res = router.dispatch(&req, "minter", &gate).await;
        assert_eq!(res.result.unwrap()["status"], "ok");
    }
}
