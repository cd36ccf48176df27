use std::{sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use serde_json::json;
use testresult::TestResult;

use crate::{execute_job, run_job, Address, Config, Dispatcher, Job, JsonRpc, Listener, MethodError};

const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

fn local(port: u16) -> Address {
    Address::Tcp {
        host: "127.0.0.1".to_owned(),
        port,
    }
}

fn pick_port() -> Result<u16, &'static str> {
    portpicker::pick_unused_port().ok_or("no port available")
}

/// Accept clients until the listener is stopped, giving each its own
/// engine set up by `setup`.
fn serve<F>(listener: Listener, setup: F) -> Arc<Listener>
where
    F: Fn(&JsonRpc) + Send + Sync + 'static,
{
    let listener = Arc::new(listener);
    let accepting = listener.clone();
    tokio::spawn(async move {
        while let Some(connection) = accepting.accept().await {
            let engine = JsonRpc::new(connection);
            setup(&engine);
            tokio::spawn(engine.run());
        }
    });
    listener
}

/// A device with a quick method, two long ones that heartbeat, and one that
/// never finishes.
fn device_methods(engine: &JsonRpc) {
    engine.add_method("home", |(axes,): (String,)| async move {
        Ok::<_, MethodError>(json!({ "homed": axes }))
    });
    engine.add_method("print", |()| async {
        let job = Job::new(1, "print");
        let printing = job.clone();
        tokio::spawn(async move {
            printing.started().await;
            for percent in [25, 50, 75] {
                tokio::time::sleep(Duration::from_millis(10)).await;
                printing.heartbeat(json!({ "percent": percent }));
            }
            printing.end(json!("done"));
        });
        Ok::<_, MethodError>(job)
    });
    engine.add_method("slow_print", |()| async {
        let job = Job::new(3, "slow_print");
        let printing = job.clone();
        tokio::spawn(async move {
            printing.started().await;
            for percent in 1..=10 {
                tokio::time::sleep(Duration::from_millis(30)).await;
                printing.heartbeat(json!({ "percent": percent * 10 }));
            }
            printing.end(json!("done"));
        });
        Ok::<_, MethodError>(job)
    });
    engine.add_method("hang", |()| async { Ok::<_, MethodError>(Job::new(2, "hang")) });
}

async fn client(address: &Address) -> Result<Arc<JsonRpc>, crate::TransportError> {
    let engine = JsonRpc::new(address.connect().await?);
    tokio::spawn(engine.clone().run());
    Ok(engine)
}

#[tokio::test]
async fn test_call_through_daemon() -> TestResult {
    let device_port = pick_port()?;
    let device = serve(local(device_port).listen().await?, device_methods);

    let config = Config::from_str(&format!(
        r#"
        [machines.bench]
        address = "tcp:127.0.0.1:{}"
        description = "bench printer"

        [machines.gone]
        address = "tcp:127.0.0.1:1"
    "#,
        device_port
    ))?;
    let dispatcher = Dispatcher::new();
    dispatcher.connect_machines(&config).await;

    let daemon_port = pick_port()?;
    let daemon = {
        let dispatcher = dispatcher.clone();
        serve(local(daemon_port).listen().await?, move |engine| dispatcher.register(engine))
    };
    let client = client(&local(daemon_port)).await?;

    let machines = execute_job(&client.request("machines", None), TIMEOUT, None).await?;
    assert_eq!(machines[0]["id"], json!("bench"));
    assert_eq!(machines[0]["connected"], json!(true));
    assert_eq!(machines[1]["id"], json!("gone"));
    assert_eq!(machines[1]["connected"], json!(false));

    let homed = client.request(
        "call",
        Some(json!({"machine": "bench", "method": "home", "params": ["xy"]})),
    );
    assert_eq!(execute_job(&homed, TIMEOUT, None).await?, json!({"homed": "xy"}));

    let printed = client.request("call", Some(json!({"machine": "bench", "method": "print"})));
    assert_eq!(execute_job(&printed, TIMEOUT, None).await?, json!("done"));

    daemon.stop();
    device.stop();
    dispatcher.shutdown().await;
    client.close().await;
    Ok(())
}

#[tokio::test]
async fn test_heartbeats_keep_remote_job_alive() -> TestResult {
    let device_port = pick_port()?;
    let device = serve(local(device_port).listen().await?, device_methods);
    let engine = client(&local(device_port)).await?;

    // Runs three times longer than the heartbeat deadline.
    let print = engine.request("slow_print", None);
    let result = execute_job(&print, TIMEOUT, Some(Duration::from_millis(100))).await?;
    assert_eq!(result, json!("done"));
    assert_eq!(print.status().heartbeats, 10);
    assert_eq!(print.status().progress, Some(json!({"percent": 100})));

    let config = Config::from_str(&format!(
        r#"
        [machines.bench]
        address = "tcp:127.0.0.1:{}"
    "#,
        device_port
    ))?;
    let dispatcher = Dispatcher::new();
    dispatcher.connect_machines(&config).await;
    let daemon_port = pick_port()?;
    let daemon = {
        let dispatcher = dispatcher.clone();
        serve(local(daemon_port).listen().await?, move |engine| dispatcher.register(engine))
    };
    let daemon_client = client(&local(daemon_port)).await?;

    let forwarded = daemon_client.request("call", Some(json!({"machine": "bench", "method": "slow_print"})));
    let result = execute_job(&forwarded, TIMEOUT, Some(Duration::from_millis(100))).await?;
    assert_eq!(result, json!("done"));
    assert_eq!(forwarded.status().heartbeats, 10);

    daemon.stop();
    device.stop();
    dispatcher.shutdown().await;
    daemon_client.close().await;
    engine.close().await;
    Ok(())
}

#[tokio::test]
async fn test_unresponsive_machine() -> TestResult {
    let device_port = pick_port()?;
    let device = serve(local(device_port).listen().await?, device_methods);
    let engine = client(&local(device_port)).await?;

    let hang = engine.request("hang", None);
    let error = run_job(&hang, Some(Duration::from_millis(100)), None)
        .await
        .err()
        .ok_or("hang should time out")?;
    assert!(error.is_not_responsive());

    // The abandoned request no longer occupies an in-flight slot.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.in_flight(), 0);

    device.stop();
    engine.close().await;
    Ok(())
}

#[tokio::test]
async fn test_device_disconnect_fails_requests() -> TestResult {
    let device_port = pick_port()?;
    let device = serve(local(device_port).listen().await?, device_methods);
    let engine = client(&local(device_port)).await?;

    let hang = engine.request("hang", None);
    hang.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Stopping the client ends its read loop with the request unanswered.
    engine.stop();
    match execute_job(&hang, TIMEOUT, None).await {
        Err(crate::JobError::Failed { failure, .. }) => assert_eq!(failure["name"], json!("ConnectionClosed")),
        other => panic!("unexpected result {:?}", other),
    }

    device.stop();
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn test_pipe_daemon_lifecycle() -> TestResult {
    let path = std::env::temp_dir().join(format!("machined-{}.socket", uuid::Uuid::new_v4().simple()));
    let address: Address = format!("pipe:{}", path.display()).parse()?;

    let dispatcher = Dispatcher::new();
    let daemon = {
        let dispatcher = dispatcher.clone();
        serve(address.listen().await?, move |engine| dispatcher.register(engine))
    };

    let client = client(&address).await?;
    let pong = execute_job(&client.request("ping", None), TIMEOUT, None).await?;
    assert_eq!(pong, json!("pong"));

    // A second daemon on the same pipe is refused while the first is live.
    assert!(matches!(
        address.listen().await,
        Err(crate::TransportError::AlreadyRunning(_))
    ));

    daemon.stop();
    daemon.cleanup();
    assert!(!path.exists());
    client.close().await;
    Ok(())
}
