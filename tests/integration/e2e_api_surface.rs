//! End-to-end: parameter resolution order and authorization chains.
//!
//! Parameters resolve from the request, then defaults, then null (when
//! nullable); service-sourced parameters come out of the per-call service
//! map; over-supplying positional parameters is an argument error.
//! Authorization predicates run in declaration order and the first false
//! rejects the call.

use duplex_rpc::{
    ApiBuilder, ApiRegistry, Expectation, MethodBuilder, MethodOutcome, ParamSpec,
    ProcessorOptions, RpcError, ServiceMap, error_codes,
};
use drpc_test_utils::ProcessorPair;
use serde_json::json;
use std::sync::Arc;

/// Application service resolved by type for service-sourced parameters.
struct Motd(&'static str);

fn api_under_test() -> ApiRegistry {
    let greet = MethodBuilder::new("greet")
        .param(ParamSpec::rpc("name", Expectation::String))
        .param(
            ParamSpec::rpc("greeting", Expectation::String).default_value(json!("hello")),
        )
        .param(ParamSpec::rpc("suffix", Expectation::String).nullable())
        .handler(|_ctx, args| async move {
            let name = args[0].as_str().unwrap_or("?").to_owned();
            let greeting = args[1].as_str().unwrap_or("?").to_owned();
            let suffix = args[2].as_str().unwrap_or("").to_owned();
            Ok(MethodOutcome::Value(json!(format!(
                "{greeting}, {name}{suffix}"
            ))))
        })
        .finish();

    let motd = MethodBuilder::new("motd")
        .param(ParamSpec::service::<Motd>("motd"))
        .handler(|_ctx, args| async move {
            let motd = args[0].service::<Motd>().expect("service must resolve");
            Ok(MethodOutcome::Value(json!(motd.0)))
        })
        .finish();

    let strict = MethodBuilder::new("strict")
        .param(ParamSpec::rpc("n", Expectation::Number))
        .handler(|_ctx, args| async move {
            Ok(MethodOutcome::Value(
                args[0].as_value().cloned().unwrap_or(serde_json::Value::Null),
            ))
        })
        .finish();

    let secret = MethodBuilder::new("secret")
        .authorize(|ctx| async move {
            ctx.request()
                .parameters
                .first()
                .and_then(serde_json::Value::as_str)
                == Some("open-sesame")
        })
        .param(ParamSpec::rpc("password", Expectation::String))
        .handler(|_ctx, _args| async move { Ok(MethodOutcome::Value(json!("granted"))) })
        .finish();

    let open = MethodBuilder::new("open")
        .skip_authorization()
        .handler(|_ctx, _args| async move { Ok(MethodOutcome::Value(json!("always"))) })
        .finish();

    ApiRegistry::builder()
        .api(
            ApiBuilder::new("guarded")
                // API-level gate runs before method-level predicates.
                .authorize(|ctx| async move { ctx.request().method != "forbidden" })
                .method(greet)
                .method(motd)
                .method(strict)
                .method(secret)
                .method(open)
                .method(
                    MethodBuilder::new("forbidden")
                        .handler(|_ctx, _args| async move {
                            Ok(MethodOutcome::Value(json!("unreachable")))
                        })
                        .finish(),
                )
                .finish(),
        )
        .finish()
}

fn server_options() -> ProcessorOptions {
    let default_services = ServiceMap::default();
    default_services.insert(Arc::new(Motd("service injected")));
    ProcessorOptions {
        apis: api_under_test(),
        default_services,
        ..ProcessorOptions::default()
    }
}

fn pair() -> ProcessorPair {
    ProcessorPair::connect(server_options(), ProcessorOptions::default())
}

fn expect_remote_code(result: Result<Option<serde_json::Value>, RpcError>, code: &str) {
    match result {
        Err(RpcError::Remote(info)) => assert_eq!(info.code, code),
        other => panic!("expected remote {code}, got {other:?}"),
    }
}

#[tokio::test]
async fn defaults_and_nullable_fill_missing_parameters() {
    let pair = pair();

    let full = pair
        .b
        .send_request(None, "greet", vec![json!("ada"), json!("hi"), json!("!")])
        .await
        .unwrap();
    assert_eq!(full, Some(json!("hi, ada!")));

    // Missing `greeting` takes the declared default; missing `suffix` is
    // nullable and resolves to null.
    let partial = pair
        .b
        .send_request(None, "greet", vec![json!("ada")])
        .await
        .unwrap();
    assert_eq!(partial, Some(json!("hello, ada")));

    // Missing required parameter.
    let missing = pair.b.send_request(None, "greet", vec![]).await;
    expect_remote_code(missing, error_codes::ARGUMENT_ERROR);

    pair.shutdown().await;
}

#[tokio::test]
async fn service_parameters_resolve_from_the_service_map() {
    let pair = pair();

    let result = pair.b.send_request(None, "motd", vec![]).await.unwrap();
    assert_eq!(result, Some(json!("service injected")));

    pair.shutdown().await;
}

#[tokio::test]
async fn arity_and_type_violations_are_argument_errors() {
    let pair = pair();

    let too_many = pair
        .b
        .send_request(None, "strict", vec![json!(1), json!(2)])
        .await;
    expect_remote_code(too_many, error_codes::ARGUMENT_ERROR);

    let wrong_type = pair
        .b
        .send_request(None, "strict", vec![json!("not a number")])
        .await;
    expect_remote_code(wrong_type, error_codes::ARGUMENT_ERROR);

    let null_for_required = pair
        .b
        .send_request(None, "strict", vec![serde_json::Value::Null])
        .await;
    expect_remote_code(null_for_required, error_codes::ARGUMENT_ERROR);

    pair.shutdown().await;
}

#[tokio::test]
async fn authorization_chain_rejects_and_admits_in_order() {
    let pair = pair();

    let granted = pair
        .b
        .send_request(None, "secret", vec![json!("open-sesame")])
        .await
        .unwrap();
    assert_eq!(granted, Some(json!("granted")));

    let rejected = pair
        .b
        .send_request(None, "secret", vec![json!("wrong")])
        .await;
    expect_remote_code(rejected, error_codes::NOT_AUTHORIZED);

    // The API-level predicate rejects before the method ever runs.
    let api_gate = pair.b.send_request(None, "forbidden", vec![]).await;
    expect_remote_code(api_gate, error_codes::NOT_AUTHORIZED);

    // skip_authorization bypasses every predicate.
    let open = pair.b.send_request(None, "open", vec![]).await.unwrap();
    assert_eq!(open, Some(json!("always")));

    pair.shutdown().await;
}

#[tokio::test]
async fn unauthorized_handler_runs_and_can_tear_the_link_down() {
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut options = server_options();
    options.unauthorized_handler = Some(Arc::new(move |method: &str| {
        let _ = seen_tx.send(method.to_owned());
    }));
    options.disconnect_on_unauthorized = true;
    let pair = ProcessorPair::connect(options, ProcessorOptions::default());

    let rejected = pair.b.send_request(None, "secret", vec![json!("wrong")]).await;
    expect_remote_code(rejected, error_codes::NOT_AUTHORIZED);
    assert_eq!(seen_rx.recv().await.as_deref(), Some("secret"));

    // Per policy, the serving side tears the link down after answering.
    tokio::time::timeout(std::time::Duration::from_secs(2), pair.a.closed())
        .await
        .expect("server must disconnect on unauthorized");
}

#[tokio::test]
async fn method_scoped_skip_does_not_leak_across_methods() {
    let pair = pair();

    // `open` skipped authorization, but `secret` still enforces it.
    let open = pair.b.send_request(None, "open", vec![]).await.unwrap();
    assert_eq!(open, Some(json!("always")));
    let rejected = pair.b.send_request(None, "secret", vec![json!("nope")]).await;
    expect_remote_code(rejected, error_codes::NOT_AUTHORIZED);

    pair.shutdown().await;
}
