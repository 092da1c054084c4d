use std::sync::Arc;
use std::time::{Duration, Instant};

use prerender::engine::mock::{Behavior, ScriptedFactory};
use prerender::{EnginePool, Params, PooledRenderer, Render, RenderConfig, RenderError};

fn renderer(factory: ScriptedFactory, deadline: Duration) -> PooledRenderer {
    PooledRenderer::new(EnginePool::new(factory), RenderConfig { deadline })
}

#[tokio::test]
async fn renders_content_and_title() {
    let renderer = PooledRenderer::with_factory(ScriptedFactory::replying(
        r#"{"app":"<div>hi</div>","title":"<title>T</title>"}"#,
    ));

    let result = renderer.render(Params::new("/", "req-1")).await.unwrap();
    assert_eq!(result.rendered, "<div>hi</div>");
    assert_eq!(result.title, "<title>T</title>");
    assert_eq!(result.redirect_target(), None);
}

#[tokio::test]
async fn script_error_still_carries_redirect() {
    let renderer = PooledRenderer::with_factory(ScriptedFactory::replying(
        r#"{"error":"boom","redirect":"/login"}"#,
    ));

    let err = renderer.render(Params::new("/private", "req-2")).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert_eq!(err.redirect(), Some("/login"));
}

#[tokio::test]
async fn no_argument_and_undefined_fail_the_same_way() {
    let renderer = PooledRenderer::with_factory(ScriptedFactory::new(|params: &Params| {
        if params.url == "/empty" {
            Behavior::Reply(None)
        } else {
            Behavior::reply("undefined")
        }
    }));

    let empty = renderer.render(Params::new("/empty", "a")).await.unwrap_err();
    let undefined = renderer.render(Params::new("/undefined", "b")).await.unwrap_err();

    assert!(matches!(empty, RenderError::NoResult));
    assert!(matches!(undefined, RenderError::NoResult));
    assert_eq!(empty.to_string(), "no result returned from rendering engine");
    assert_eq!(empty.to_string(), undefined.to_string());
}

#[tokio::test]
async fn request_failures_keep_the_engine() {
    let factory = ScriptedFactory::new(|params: &Params| match params.url.as_str() {
        "/throw" => Behavior::Throw("main is not defined".to_string()),
        "/garbage" => Behavior::reply("{not json"),
        "/script-error" => Behavior::reply(r#"{"error":"no such page"}"#),
        _ => Behavior::reply(r#"{"app":"ok"}"#),
    });
    let probe = factory.probe();
    let renderer = PooledRenderer::with_factory(factory);

    let thrown = renderer.render(Params::new("/throw", "1")).await.unwrap_err();
    assert!(matches!(thrown, RenderError::Invocation(_)));
    assert!(thrown.to_string().contains("main is not defined"));

    let garbage = renderer.render(Params::new("/garbage", "2")).await.unwrap_err();
    assert!(matches!(garbage, RenderError::Parse(_)));

    let script = renderer.render(Params::new("/script-error", "3")).await.unwrap_err();
    assert!(matches!(script, RenderError::Script { .. }));

    let ok = renderer.render(Params::new("/", "4")).await.unwrap();
    assert_eq!(ok.rendered, "ok");

    assert_eq!(probe.created(), 1);
    assert_eq!(probe.terminated(), 0);
    assert_eq!(renderer.pool().stats().await.unwrap().discarded, 0);
}

#[tokio::test]
async fn hung_engine_times_out_after_deadline_and_is_discarded() {
    let factory = ScriptedFactory::new(|params: &Params| {
        if params.url == "/hang" {
            Behavior::Hang
        } else {
            Behavior::reply(r#"{"app":"fine"}"#)
        }
    });
    let probe = factory.probe();
    let renderer = PooledRenderer::with_factory(factory);

    let started = Instant::now();
    let err = renderer.render(Params::new("/hang", "slow")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout());
    assert!(elapsed >= Duration::from_millis(950), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "gave up too late: {elapsed:?}");
    assert_eq!(probe.terminated(), 1);

    let ok = renderer.render(Params::new("/", "next")).await.unwrap();
    assert_eq!(ok.rendered, "fine");
    assert_eq!(probe.created(), 2);

    let stats = renderer.pool().stats().await.unwrap();
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn late_callback_after_timeout_is_dropped() {
    let factory = ScriptedFactory::new(|params: &Params| {
        if params.url == "/slow" {
            Behavior::reply_after(Duration::from_millis(150), r#"{"app":"late"}"#)
        } else {
            Behavior::reply(r#"{"app":"on time"}"#)
        }
    });
    let probe = factory.probe();
    let renderer = renderer(factory, Duration::from_millis(50));

    let err = renderer.render(Params::new("/slow", "a")).await.unwrap_err();
    assert!(matches!(err, RenderError::TimedOut(d) if d == Duration::from_millis(50)));

    // Let the late callback fire into the abandoned channel.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ok = renderer.render(Params::new("/", "b")).await.unwrap();
    assert_eq!(ok.rendered, "on time");
    assert_eq!(probe.created(), 2);
    assert_eq!(probe.terminated(), 1);
}

#[tokio::test]
async fn blocked_entry_point_times_out_and_is_terminated() {
    let factory = ScriptedFactory::new(|params: &Params| {
        if params.url == "/block" {
            Behavior::Block
        } else {
            Behavior::reply(r#"{"app":"fine"}"#)
        }
    });
    let probe = factory.probe();
    let renderer = renderer(factory, Duration::from_millis(50));

    let err = renderer.render(Params::new("/block", "a")).await.unwrap_err();
    assert!(matches!(err, RenderError::TimedOut(d) if d == Duration::from_millis(50)));
    assert_eq!(probe.terminated(), 1);

    let ok = renderer.render(Params::new("/", "b")).await.unwrap();
    assert_eq!(ok.rendered, "fine");
    assert_eq!(probe.created(), 2);
    assert_eq!(renderer.pool().stats().await.unwrap().discarded, 1);
}

#[tokio::test]
async fn dropped_callback_is_no_result_and_keeps_the_engine() {
    let factory = ScriptedFactory::new(|params: &Params| {
        if params.url == "/forget" {
            Behavior::DropCallback
        } else {
            Behavior::reply(r#"{"app":"fine"}"#)
        }
    });
    let probe = factory.probe();
    let renderer = PooledRenderer::with_factory(factory);

    let err = renderer.render(Params::new("/forget", "a")).await.unwrap_err();
    assert!(matches!(err, RenderError::NoResult));
    assert_eq!(probe.created(), 1);
    assert_eq!(probe.terminated(), 0);

    let ok = renderer.render(Params::new("/", "b")).await.unwrap();
    assert_eq!(ok.rendered, "fine");
    assert_eq!(probe.created(), 1);
    assert_eq!(renderer.pool().stats().await.unwrap().discarded, 0);
}

#[tokio::test]
async fn outbound_headers_follow_each_call() {
    let factory = ScriptedFactory::replying("{}");
    let probe = factory.probe();
    let renderer = PooledRenderer::with_factory(factory);

    let with_cookie = Params::new("/me", "a").with_header("Cookie", "user=ann");
    renderer.render(with_cookie).await.unwrap();
    assert_eq!(probe.last_headers()["Cookie"], vec!["user=ann"]);

    renderer.render(Params::new("/me", "b")).await.unwrap();
    assert!(probe.last_headers().is_empty());
    assert_eq!(probe.created(), 1);
}

#[tokio::test]
async fn construction_failure_is_returned_to_the_caller() {
    let renderer = PooledRenderer::with_factory(ScriptedFactory::replying("{}").failing_first(1));

    let err = renderer.render(Params::new("/", "a")).await.unwrap_err();
    assert!(matches!(err, RenderError::Construction(_)));

    assert!(renderer.render(Params::new("/", "b")).await.is_ok());
}

#[tokio::test]
async fn render_after_shutdown_fails() {
    let renderer = PooledRenderer::with_factory(ScriptedFactory::replying("{}"));
    renderer.pool().shutdown().await.unwrap();

    let err = renderer.render(Params::new("/", "a")).await.unwrap_err();
    assert!(matches!(err, RenderError::PoolClosed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_renders_never_share_an_engine() {
    let factory = ScriptedFactory::new(|params: &Params| {
        Behavior::reply_after(
            Duration::from_millis(5),
            format!(r#"{{"app":"{}"}}"#, params.url),
        )
    });
    let probe = factory.probe();
    let renderer = Arc::new(PooledRenderer::with_factory(factory));

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let renderer = Arc::clone(&renderer);
            tokio::spawn(async move {
                let url = format!("/page/{i}");
                let result = renderer
                    .render(Params::new(url.clone(), i.to_string()))
                    .await
                    .unwrap();
                assert_eq!(result.rendered, url);
            })
        })
        .collect();
    for task in futures::future::join_all(tasks).await {
        task.unwrap();
    }

    assert_eq!(probe.invocations(), 64);
    assert_eq!(probe.overlaps(), 0);
    assert!(probe.created() <= 64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn constructions_and_destructions_balance_under_stress() {
    let factory = ScriptedFactory::new(|params: &Params| {
        let n: usize = params.request_id.parse().unwrap_or(0);
        match n % 10 {
            0 => Behavior::Hang,
            1 => Behavior::Throw("bad page".to_string()),
            2 => Behavior::reply("{oops"),
            _ => Behavior::reply_after(Duration::from_millis(2), r#"{"app":"ok"}"#),
        }
    });
    let probe = factory.probe();
    let renderer = Arc::new(renderer(factory, Duration::from_millis(100)));

    let tasks: Vec<_> = (0..200)
        .map(|i| {
            let renderer = Arc::clone(&renderer);
            tokio::spawn(async move { renderer.render(Params::new("/", i.to_string())).await })
        })
        .collect();

    let mut timeouts = 0;
    for task in futures::future::join_all(tasks).await {
        if let Err(e) = task.unwrap() {
            if e.is_timeout() {
                timeouts += 1;
            }
        }
    }
    assert_eq!(timeouts, 20);

    let stats = renderer.pool().shutdown().await.unwrap();
    assert_eq!(stats.discarded, 20);
    assert_eq!(stats.on_loan(), 0);
    assert_eq!(stats.created as usize, probe.created());

    assert_eq!(probe.overlaps(), 0);
    assert_eq!(probe.terminated(), probe.created());
    assert_eq!(probe.dropped(), probe.created());
}
