//! Cross-component end-to-end scenarios (spec §8): these drive `Forge`
//! and `Pocket` through their public NWPC-shaped methods the way two
//! real peers would exchange them over a relay, just without an actual
//! relay round trip in between (`NullRelay` never delivers, so replies
//! are threaded straight from one peer's return value into the next).

use tat_protocol::error::Error;
use tat_protocol::forge::{ForgeParams, TransferOutput, TransferParams, VerifyParams};
use tat_protocol::messaging::Request;
use tat_protocol::test_utils::{gen_keypair, new_forge, xonly_hex};
use tat_protocol::token::{HashFunction, Payload, Token, TokenType, HTLC};

fn extract_token(result: &serde_json::Value) -> String {
    result["token"].as_str().expect("minted/transferred result carries a token").to_owned()
}

/// Scenario: mint-transfer-verify across three holders A, B, C. A mints
/// 100 from the forge, sends 60 to B (keeping 40 change), B forwards
/// all 60 to C. Balances settle at A=40, B=0, C=60 and every live token
/// still verifies true.
#[tokio::test]
async fn mint_transfer_verify_across_three_holders() {
    let (forge, _forge_sk) = new_forge(0, TokenType::Fungible);
    let owner_hex = forge.core.public_key_hex();

    let a_sk = gen_keypair();
    let a_hex = xonly_hex(&a_sk);
    let b_sk = gen_keypair();
    let b_hex = xonly_hex(&b_sk);
    let c_hex = xonly_hex(&gen_keypair());

    let minted = forge
        .forge(&owner_hex, ForgeParams { to: a_hex.clone(), amount: Some(100) })
        .await
        .unwrap();
    let a_token = extract_token(&minted);

    let (restored, _) = Token::restore(&a_token).unwrap();
    let witness = restored.sign(&a_sk).unwrap();
    let a_to_b = forge
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![a_token],
                outs: vec![TransferOutput { to: b_hex.clone(), amount: Some(60), token_id: None }],
                witness_data: Some(vec![witness]),
                htlc_secret: None,
            },
        )
        .await
        .unwrap();
    let outputs = a_to_b["outputs"].as_array().unwrap();
    assert_eq!(outputs.len(), 2, "expected a 60-to-B output plus 40 change back to A");
    let b_token = outputs
        .iter()
        .find(|o| o["to"] == b_hex)
        .map(|o| o["token"].as_str().unwrap().to_owned())
        .unwrap();
    let a_change = outputs
        .iter()
        .find(|o| o["to"] == a_hex)
        .map(|o| o["token"].as_str().unwrap().to_owned())
        .unwrap();

    let (b_restored, _) = Token::restore(&b_token).unwrap();
    let b_witness = b_restored.sign(&b_sk).unwrap();
    let b_to_c = forge
        .transfer(
            &b_hex,
            TransferParams {
                ins: vec![b_token],
                outs: vec![TransferOutput { to: c_hex.clone(), amount: Some(60), token_id: None }],
                witness_data: Some(vec![b_witness]),
                htlc_secret: None,
            },
        )
        .await
        .unwrap();
    let c_token = b_to_c["outputs"][0]["token"].as_str().unwrap().to_owned();

    assert_eq!(forge.verify(&a_hex, VerifyParams { token_jwt: a_change }).await.unwrap()["valid"], true);
    assert_eq!(forge.verify(&c_hex, VerifyParams { token_jwt: c_token }).await.unwrap()["valid"], true);

    let (change_token, _) = Token::restore(outputs.iter().find(|o| o["to"] == a_hex).unwrap()["token"].as_str().unwrap()).unwrap();
    assert_eq!(change_token.payload.amount, Some(40));
}

/// Scenario: a TAT (non-fungible) token's sequential hand-off from the
/// forge to A to B to C. Every hop mints a fresh signed token carrying
/// the same `tokenID`, and each prior JWT is rejected as already spent.
#[tokio::test]
async fn tat_sequential_handoff() {
    let (forge, _) = new_forge(0, TokenType::Tat);
    let owner_hex = forge.core.public_key_hex();

    let a_sk = gen_keypair();
    let a_hex = xonly_hex(&a_sk);
    let b_sk = gen_keypair();
    let b_hex = xonly_hex(&b_sk);
    let c_hex = xonly_hex(&gen_keypair());

    let minted = forge.forge(&owner_hex, ForgeParams { to: a_hex.clone(), amount: None }).await.unwrap();
    let token_a = extract_token(&minted);
    let (restored_a, _) = Token::restore(&token_a).unwrap();
    let token_id = restored_a.payload.token_id.unwrap();

    let witness_a = restored_a.sign(&a_sk).unwrap();
    let a_to_b = forge
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![token_a.clone()],
                outs: vec![TransferOutput { to: b_hex.clone(), amount: None, token_id: Some(token_id) }],
                witness_data: Some(vec![witness_a]),
                htlc_secret: None,
            },
        )
        .await
        .unwrap();
    let token_b = a_to_b["outputs"][0]["token"].as_str().unwrap().to_owned();
    let (restored_b, _) = Token::restore(&token_b).unwrap();
    assert_eq!(restored_b.payload.token_id, Some(token_id));

    let witness_b = restored_b.sign(&b_sk).unwrap();
    let b_to_c = forge
        .transfer(
            &b_hex,
            TransferParams {
                ins: vec![token_b.clone()],
                outs: vec![TransferOutput { to: c_hex.clone(), amount: None, token_id: Some(token_id) }],
                witness_data: Some(vec![witness_b]),
                htlc_secret: None,
            },
        )
        .await
        .unwrap();
    let token_c = b_to_c["outputs"][0]["token"].as_str().unwrap().to_owned();
    let (restored_c, _) = Token::restore(&token_c).unwrap();
    assert_eq!(restored_c.payload.token_id, Some(token_id));
    assert_eq!(restored_c.payload.p2pk_lock.as_deref(), Some(c_hex.as_str()));

    assert_eq!(forge.verify(&c_hex, VerifyParams { token_jwt: token_c }).await.unwrap()["valid"], true);
    assert_eq!(forge.verify(&a_hex, VerifyParams { token_jwt: token_a }).await.unwrap()["valid"], false);
    assert_eq!(forge.verify(&b_hex, VerifyParams { token_jwt: token_b }).await.unwrap()["valid"], false);
}

/// Scenario: two concurrent `transfer` calls racing the same input.
/// Exactly one commits; the other observes `AlreadySpent` with the 409
/// reconciliation payload, never a double-mint of outputs.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn double_spend_race_exactly_one_winner() {
    let (forge, _) = new_forge(0, TokenType::Fungible);
    let owner_hex = forge.core.public_key_hex();

    let a_sk = gen_keypair();
    let a_hex = xonly_hex(&a_sk);
    let b_hex = xonly_hex(&gen_keypair());
    let c_hex = xonly_hex(&gen_keypair());

    let minted = forge.forge(&owner_hex, ForgeParams { to: a_hex.clone(), amount: Some(10) }).await.unwrap();
    let jwt = extract_token(&minted);
    let (token, _) = Token::restore(&jwt).unwrap();
    let witness = token.sign(&a_sk).unwrap();

    let params_1 = TransferParams {
        ins: vec![jwt.clone()],
        outs: vec![TransferOutput { to: b_hex, amount: Some(10), token_id: None }],
        witness_data: Some(vec![witness.clone()]),
        htlc_secret: None,
    };
    let params_2 = TransferParams {
        ins: vec![jwt],
        outs: vec![TransferOutput { to: c_hex, amount: Some(10), token_id: None }],
        witness_data: Some(vec![witness]),
        htlc_secret: None,
    };

    let (r1, r2) = tokio::join!(forge.transfer(&a_hex, params_1), forge.transfer(&a_hex, params_2));

    let successes = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    let conflicts = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Err(Error::AlreadySpent { .. })))
        .count();
    assert_eq!(successes, 1, "exactly one of the racing transfers should commit");
    assert_eq!(conflicts, 1, "the loser should see AlreadySpent, not a silent failure");
}

/// Scenario: the 403 authorization gate on `forge` — an unauthorized
/// sender is rejected by `OnlyAuthorized` before `Forge::forge` ever
/// runs; the owner (implicitly authorized) succeeds.
#[tokio::test]
async fn unauthorized_forge_request_is_rejected_with_403() {
    let (forge, _) = new_forge(0, TokenType::Fungible);
    let owner_hex = forge.core.public_key_hex();
    let recipient_hex = xonly_hex(&gen_keypair());
    let stranger_hex = xonly_hex(&gen_keypair());

    let params = serde_json::json!({"to": recipient_hex, "amount": 10});
    let req = Request::new("req-1".to_owned(), "forge", &params, 0).unwrap();

    let forbidden = forge.dispatch(&req, &stranger_hex).await;
    assert_eq!(forbidden.error.unwrap().code, 403);

    let req2 = Request::new("req-2".to_owned(), "forge", &params, 0).unwrap();
    let allowed = forge.dispatch(&req2, &owner_hex).await;
    assert!(allowed.error.is_none());
    assert!(allowed.result.unwrap()["token"].is_string());
}

/// Scenario: a token past its `exp` is rejected by `transfer` with
/// `Expired`, before any witness/lock checks run.
#[tokio::test]
async fn expired_token_is_rejected() {
    let (forge, forge_sk) = new_forge(0, TokenType::Fungible);
    let issuer_hex = forge.core.public_key_hex();
    let a_sk = gen_keypair();
    let a_hex = xonly_hex(&a_sk);
    let b_hex = xonly_hex(&gen_keypair());

    let payload = Payload {
        iss: issuer_hex,
        iat: 0,
        exp: Some(1),
        amount: Some(10),
        token_id: None,
        p2pk_lock: Some(a_hex.clone()),
        time_lock: None,
        htlc: None,
        data_uri: None,
    };
    let token = Token::build(TokenType::Fungible, payload).unwrap();
    let sig = token.sign(&forge_sk).unwrap();
    let jwt = token.to_jwt(&sig).unwrap();
    let witness = token.sign(&a_sk).unwrap();

    let result = forge
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![jwt],
                outs: vec![TransferOutput { to: b_hex, amount: Some(10), token_id: None }],
                witness_data: Some(vec![witness]),
                htlc_secret: None,
            },
        )
        .await;
    assert!(matches!(result, Err(Error::Expired)));
}

/// Scenario: an HTLC-locked token can be redeemed with the right secret
/// before the timelock, but once the timelock passes the same secret no
/// longer redeems it (the redeem window is closed) and only a
/// secret-less refund succeeds.
#[tokio::test]
async fn htlc_redeem_then_expire() {
    let (forge, forge_sk) = new_forge(0, TokenType::Fungible);
    let issuer_hex = forge.core.public_key_hex();
    let a_hex = xonly_hex(&gen_keypair());
    let b_hex = xonly_hex(&gen_keypair());
    let refund_hex = xonly_hex(&gen_keypair());

    let secret = "s3cret-preimage-unlocking-fund";
    let hashlock = hex::encode(tat_protocol::crypto::sha256(secret.as_bytes()));
    let now_ms = chrono::Utc::now().timestamp_millis();
    let htlc = HTLC::new(hashlock, now_ms + 2_000, HashFunction::Sha256, now_ms).unwrap();

    let payload = Payload {
        iss: issuer_hex.clone(),
        iat: 0,
        exp: None,
        amount: Some(25),
        token_id: None,
        p2pk_lock: None,
        time_lock: None,
        htlc: Some(htlc),
        data_uri: None,
    };
    let token = Token::build(TokenType::Fungible, payload).unwrap();
    let sig = token.sign(&forge_sk).unwrap();
    let jwt = token.to_jwt(&sig).unwrap();

    let wrong_secret_attempt = forge
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![jwt.clone()],
                outs: vec![TransferOutput { to: b_hex.clone(), amount: Some(25), token_id: None }],
                witness_data: None,
                htlc_secret: Some("not-the-right-preimage-at-all".to_owned()),
            },
        )
        .await;
    assert!(matches!(wrong_secret_attempt, Err(Error::Locked)));

    let redeemed = forge
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![jwt.clone()],
                outs: vec![TransferOutput { to: b_hex.clone(), amount: Some(25), token_id: None }],
                witness_data: None,
                htlc_secret: Some(secret.to_owned()),
            },
        )
        .await
        .unwrap();
    assert_eq!(redeemed["outputs"][0]["to"], b_hex);

    let (forge_after_expiry, expiry_sk) = new_forge(0, TokenType::Fungible);
    let expiry_issuer_hex = forge_after_expiry.core.public_key_hex();
    let past_htlc = HTLC::new(
        hex::encode(tat_protocol::crypto::sha256(secret.as_bytes())),
        now_ms - 1,
        HashFunction::Sha256,
        now_ms - 120_000,
    )
    .unwrap();
    let expired_payload = Payload {
        iss: expiry_issuer_hex,
        iat: 0,
        exp: None,
        amount: Some(25),
        token_id: None,
        p2pk_lock: None,
        time_lock: None,
        htlc: Some(past_htlc),
        data_uri: None,
    };
    let expired_token = Token::build(TokenType::Fungible, expired_payload).unwrap();
    let expired_sig = expired_token.sign(&expiry_sk).unwrap();
    let expired_jwt = expired_token.to_jwt(&expired_sig).unwrap();

    let late_redeem_attempt = forge_after_expiry
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![expired_jwt.clone()],
                outs: vec![TransferOutput { to: b_hex.clone(), amount: Some(25), token_id: None }],
                witness_data: None,
                htlc_secret: Some(secret.to_owned()),
            },
        )
        .await;
    assert!(
        matches!(late_redeem_attempt, Err(Error::Locked)),
        "a secret submitted past the timelock must not redeem, even if it's correct"
    );

    let refund = forge_after_expiry
        .transfer(
            &a_hex,
            TransferParams {
                ins: vec![expired_jwt],
                outs: vec![TransferOutput { to: refund_hex.clone(), amount: Some(25), token_id: None }],
                witness_data: None,
                htlc_secret: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(refund["outputs"][0]["to"], refund_hex);
}
