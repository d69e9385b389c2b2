//! Control-plane integration: backend manager against real worker
//! connections over TCP.

use std::time::Duration;

use serde_json::json;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use loopcast_backend_core::messages;
use loopcast_backend_core::{Backend, BackendConfig, BackendEvent, Error};
use loopcast_event_core::{split_tcp, EventMessage, EventReader, EventWriter};
use loopcast_media_core::Forward;

type Reader = EventReader<OwnedReadHalf>;
type Writer = EventWriter<OwnedWriteHalf>;

async fn start_backend() -> (Backend, tokio::sync::mpsc::Receiver<BackendEvent>) {
    let config = BackendConfig::new("127.0.0.1:0".parse().unwrap());
    Backend::start(config).await.unwrap()
}

async fn connect_worker(backend: &Backend, uuid: Uuid) -> (Reader, Writer) {
    let stream = TcpStream::connect(backend.local_addr()).await.unwrap();
    let (reader, mut writer) = split_tcp(stream);
    writer.send(&messages::register(uuid)).await.unwrap();
    (reader, writer)
}

/// Worker half that acknowledges every request with a success response
/// echoing the request parameters.
fn spawn_responder(mut reader: Reader, mut writer: Writer) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(Some(msg)) = reader.recv().await {
            if msg.is_response() {
                continue;
            }
            if msg.event == messages::EVENT_SHUTDOWN {
                break;
            }
            let echo = msg.parameter.clone().unwrap_or_else(|| json!({}));
            let response = EventMessage::success_response(&msg, echo);
            if writer.send(&response).await.is_err() {
                break;
            }
        }
    })
}

fn forward() -> Forward {
    Forward {
        host: "127.0.0.1".to_string(),
        port: 46200,
        ssrc: 4711,
        payload_type: 100,
    }
}

#[tokio::test]
async fn test_register_is_followed_by_exactly_one_configure() {
    let (backend, mut events) = start_backend().await;
    let uuid = Uuid::new_v4();
    let (mut reader, mut writer) = connect_worker(&backend, uuid).await;

    // the first and only message after register is configure
    let msg = timeout(Duration::from_secs(2), reader.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(msg.event, messages::EVENT_CONFIGURE);
    assert!(msg.error.is_none());
    messages::parse_configure(&msg).unwrap();

    // nothing else arrives unprompted
    assert!(
        timeout(Duration::from_millis(300), reader.recv()).await.is_err(),
        "no event before the configure response"
    );

    // acknowledging the configure surfaces the registration
    writer
        .send(&EventMessage::success_response(&msg, json!({})))
        .await
        .unwrap();
    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, BackendEvent::MixerRegistered { slot: 0, uuid });

    backend.stop().await;
}

#[tokio::test]
async fn test_wrong_worker_type_closes_the_socket() {
    let (backend, _events) = start_backend().await;

    let stream = TcpStream::connect(backend.local_addr()).await.unwrap();
    let (mut reader, mut writer) = split_tcp(stream);
    let register = EventMessage::request(
        messages::EVENT_REGISTER,
        json!({ "uuid": Uuid::new_v4(), "type": "video" }),
    );
    writer.send(&register).await.unwrap();

    // manager closes without configuring
    let closed = timeout(Duration::from_secs(2), reader.recv()).await.unwrap();
    assert!(matches!(closed, Ok(None) | Err(_)));

    backend.stop().await;
}

#[tokio::test]
async fn test_acquire_and_release_roundtrip() {
    let (backend, _events) = start_backend().await;
    let (reader, writer) = connect_worker(&backend, Uuid::new_v4()).await;
    let _responder = spawn_responder(reader, writer);

    // wait for the worker to be live
    timeout(Duration::from_secs(2), async {
        loop {
            if backend.count().await.unwrap() == (1, 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    backend.acquire("s-1", forward()).await.unwrap();
    assert_eq!(backend.count().await.unwrap(), (1, 1));

    backend.release("s-1").await.unwrap();
    assert_eq!(backend.count().await.unwrap(), (1, 0));

    backend.stop().await;
}

#[tokio::test]
async fn test_acquire_without_worker_is_no_resource() {
    let (backend, _events) = start_backend().await;

    let result = backend.acquire("s-1", forward()).await;
    match result {
        Err(Error::Rpc { code, .. }) => assert_eq!(code, 503),
        other => panic!("expected NoResource, got {:?}", other.err()),
    }

    backend.stop().await;
}

#[tokio::test]
async fn test_join_and_leave_keep_the_session_bound() {
    let (backend, _events) = start_backend().await;
    let (reader, writer) = connect_worker(&backend, Uuid::new_v4()).await;
    let _responder = spawn_responder(reader, writer);

    timeout(Duration::from_secs(2), async {
        while backend.count().await.unwrap() != (1, 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    backend.acquire("s-1", forward()).await.unwrap();

    let join = loopcast_media_core::LoopJoin {
        name: "loopA".to_string(),
        host: "239.0.0.1".to_string(),
        port: 5004,
        volume: 50,
    };
    backend.join("s-1", join).await.unwrap();
    backend.leave("s-1", "loopA").await.unwrap();

    // the session stays bound across loop membership changes
    assert_eq!(backend.count().await.unwrap(), (1, 1));

    backend.stop().await;
}

#[tokio::test]
async fn test_request_to_unknown_session_fails() {
    let (backend, _events) = start_backend().await;
    let (reader, writer) = connect_worker(&backend, Uuid::new_v4()).await;
    let _responder = spawn_responder(reader, writer);

    let result = backend.leave("ghost", "loopA").await;
    match result {
        Err(Error::Rpc { code, .. }) => assert_eq!(code, 440),
        other => panic!("expected SessionUnknown, got {:?}", other.err()),
    }

    backend.stop().await;
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let mut config = BackendConfig::new("127.0.0.1:0".parse().unwrap());
    config.request_timeout = Duration::from_millis(200);
    let (backend, _events) = Backend::start(config).await.unwrap();

    // worker that registers, acknowledges configure, then goes mute
    let uuid = Uuid::new_v4();
    let stream = TcpStream::connect(backend.local_addr()).await.unwrap();
    let (mut reader, mut writer) = split_tcp(stream);
    writer.send(&messages::register(uuid)).await.unwrap();
    let configure = reader.recv().await.unwrap().unwrap();
    writer
        .send(&EventMessage::success_response(&configure, json!({})))
        .await
        .unwrap();

    // callback resolves through the expiry sweep with the timeout code
    let started = std::time::Instant::now();
    let result = timeout(Duration::from_secs(5), backend.acquire("s-1", forward()))
        .await
        .expect("callback resolved before the outer deadline");
    match result {
        Err(Error::Rpc { code, .. }) => assert_eq!(code, 408),
        other => panic!("expected timeout, got {:?}", other.err()),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));

    backend.stop().await;
}

#[tokio::test]
async fn test_worker_disconnect_surfaces_mixer_lost() {
    let (backend, mut events) = start_backend().await;
    let (mut reader, mut writer) = connect_worker(&backend, Uuid::new_v4()).await;

    // serve configure + acquire, then hang up
    let configure = reader.recv().await.unwrap().unwrap();
    writer
        .send(&EventMessage::success_response(&configure, json!({})))
        .await
        .unwrap();
    let registered = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(registered, BackendEvent::MixerRegistered { .. }));

    let acquire_task = {
        let backend = backend.clone();
        tokio::spawn(async move { backend.acquire("s-1", forward()).await })
    };
    let acquire = reader.recv().await.unwrap().unwrap();
    assert_eq!(acquire.event, messages::EVENT_ACQUIRE);
    writer
        .send(&EventMessage::success_response(&acquire, json!({})))
        .await
        .unwrap();
    acquire_task.await.unwrap().unwrap();
    assert_eq!(backend.count().await.unwrap(), (1, 1));

    drop(reader);
    drop(writer);

    let lost = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        lost,
        BackendEvent::MixerLost {
            slot: 0,
            session: "s-1".to_string()
        }
    );
    assert_eq!(backend.count().await.unwrap(), (0, 0));

    backend.stop().await;
}

#[tokio::test]
async fn test_full_worker_serves_state_and_rejects_bad_join() {
    // manager + the real worker app end to end
    let (backend, mut events) = start_backend().await;

    let manager_addr = backend.local_addr();
    let worker = tokio::spawn(async move {
        let stream = TcpStream::connect(manager_addr).await.unwrap();
        loopcast_backend_core::mixer_app::serve(
            stream,
            Uuid::new_v4(),
            loopcast_media_core::MixerConfig::default(),
        )
        .await
    });

    let registered = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(registered, BackendEvent::MixerRegistered { .. }));

    backend.acquire("s-1", forward()).await.unwrap();

    // a join with an unparsable group address fails cleanly
    let bad_join = loopcast_media_core::LoopJoin {
        name: "loopA".to_string(),
        host: "not-an-address".to_string(),
        port: 5004,
        volume: 50,
    };
    assert!(backend.join("s-1", bad_join).await.is_err());

    // the state snapshot reports the bound session
    let state = backend.state("s-1").await.unwrap();
    assert_eq!(state["name"], "s-1");
    assert!(state["pid"].as_u64().is_some());

    // volume on a loop that was never joined fails cleanly
    assert!(backend.set_volume("s-1", "loopA", 70).await.is_err());

    backend.shutdown_worker("s-1").await.unwrap();
    let result = timeout(Duration::from_secs(2), worker).await.unwrap();
    assert!(result.unwrap().is_ok());

    backend.stop().await;
}
