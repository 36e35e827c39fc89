use std::net::SocketAddr;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use twiiiiiter_broker::{Router, Server, ServerConfig, ServerError, ShutdownHandle};
use twiiiiiter_client::{Client, ClientError, ServerEvent};
use twiiiiiter_protocol::v1::{
    ClientMessage, FRAME_LEN, KickReason, LoginStatus, ReceivedMessage, ServerMessage,
    SubscribeResult, Text, Username,
};
use twiiiiiter_storage::{Storage, make_sqlite_store};

const EVENT_WAIT: Duration = Duration::from_secs(5);
const QUIET_WAIT: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestServer {
    fn stop(mut self) -> anyhow::Result<()> {
        self.handle.shutdown();
        let thread = self.thread.take().context("server already stopped")?;
        thread
            .join()
            .map_err(|_| anyhow::anyhow!("server thread panicked"))??;
        Ok(())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

/// A database file under `test_data/`, removed on drop.
struct TestDb {
    path: String,
}

impl Drop for TestDb {
    fn drop(&mut self) {
        for suffix in ["", "-journal", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", self.path));
        }
    }
}

fn make_test_db() -> anyhow::Result<TestDb> {
    std::fs::create_dir_all("test_data")?;
    // random file name so parallel tests never share a database
    Ok(TestDb {
        path: format!("test_data/{}.sqlite", fastrand::u64(..)),
    })
}

fn spawn_server<S: Storage + 'static>(storage: S, config: ServerConfig) -> anyhow::Result<TestServer> {
    let server = Server::bind("127.0.0.1:0".parse::<SocketAddr>()?, Router::new(storage), config)?;
    let addr = server.local_addr();
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.run());

    Ok(TestServer {
        addr,
        handle,
        thread: Some(thread),
    })
}

fn make_test_server() -> anyhow::Result<TestServer> {
    spawn_server(make_sqlite_store(":memory:")?, ServerConfig::default())
}

async fn make_test_client(server: &TestServer, name: &str) -> anyhow::Result<Client> {
    let client = Client::connect(server.addr).await?;
    let status = client.join_as(name).await?;
    anyhow::ensure!(status == LoginStatus::Ok, "{name} could not join: {status:?}");
    Ok(client)
}

async fn next_message(client: &mut Client) -> anyhow::Result<ReceivedMessage> {
    match tokio::time::timeout(EVENT_WAIT, client.next_event()).await? {
        Some(ServerEvent::Message(msg)) => Ok(msg),
        other => anyhow::bail!("expected a twiiiiit, got {other:?}"),
    }
}

async fn expect_quiet(client: &mut Client) -> anyhow::Result<()> {
    if let Ok(event) = tokio::time::timeout(QUIET_WAIT, client.next_event()).await {
        anyhow::bail!("expected no event, got {event:?}");
    }
    Ok(())
}

fn summary(msg: &ReceivedMessage) -> String {
    format!("{}:{}", msg.author, msg.text)
}

async fn read_frame(stream: &mut TcpStream) -> anyhow::Result<ServerMessage> {
    let mut frame = [0u8; FRAME_LEN];
    tokio::time::timeout(EVENT_WAIT, stream.read_exact(&mut frame)).await??;
    Ok(ServerMessage::decode(&frame)?)
}

#[tokio::test]
async fn login_statuses() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let _alice = make_test_client(&server, "alice").await?;

    let other = Client::connect(server.addr).await?;
    assert_eq!(other.join_as("alice").await?, LoginStatus::AlreadyUsed);
    assert_eq!(other.join_as("").await?, LoginStatus::IllegalName);
    // failed attempts leave the connection free to try again
    assert_eq!(other.join_as("bob").await?, LoginStatus::Ok);

    assert!(matches!(
        other.join_as("waytoolong").await,
        Err(ClientError::Field(_))
    ));

    server.stop()
}

#[tokio::test]
async fn name_is_released_on_disconnect() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let first = make_test_client(&server, "alice").await?;
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _second = make_test_client(&server, "alice").await?;
    server.stop()
}

#[tokio::test]
async fn second_join_on_same_connection_is_kicked() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut alice = make_test_client(&server, "alice").await?;

    assert!(matches!(
        alice.join_as("alice").await,
        Err(ClientError::Kicked(KickReason::ProtocolError))
    ));
    assert_eq!(
        alice.next_event().await,
        Some(ServerEvent::Kicked(KickReason::ProtocolError))
    );

    // the kick released the name
    let _again = make_test_client(&server, "alice").await?;
    server.stop()
}

#[tokio::test]
async fn frames_after_a_kick_are_ignored() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut stream = TcpStream::connect(server.addr).await?;

    let join = ClientMessage::JoinAs(Username::try_from("x")?).encode();
    let mut wire = Vec::new();
    wire.extend_from_slice(&join);
    wire.extend_from_slice(&join);
    wire.extend_from_slice(&ClientMessage::ListSubscriptions.encode());
    stream.write_all(&wire).await?;

    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::LoginStatus(LoginStatus::Ok)
    );
    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::Kick(KickReason::ProtocolError)
    );

    // the socket closes without answering the listing
    let mut rest = Vec::new();
    match tokio::time::timeout(EVENT_WAIT, stream.read_to_end(&mut rest)).await? {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {}
        Err(e) => return Err(e.into()),
    }
    assert!(rest.is_empty(), "unexpected {} trailing bytes", rest.len());

    server.stop()
}

#[tokio::test]
async fn commands_before_join_are_kicked() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let anon = Client::connect(server.addr).await?;

    assert!(matches!(
        anon.list_subscriptions().await,
        Err(ClientError::Kicked(KickReason::ProtocolError))
    ));
    server.stop()
}

#[tokio::test]
async fn subscribe_and_unsubscribe_results() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let bob = make_test_client(&server, "bob").await?;
    let _alice = make_test_client(&server, "alice").await?;

    assert_eq!(bob.subscribe_to("alice").await?, SubscribeResult::Ok);
    assert_eq!(bob.subscribe_to("alice").await?, SubscribeResult::Unchanged);
    assert_eq!(bob.subscribe_to("ghost").await?, SubscribeResult::NotFound);
    assert_eq!(bob.subscribe_to("bob").await?, SubscribeResult::NotFound);

    assert_eq!(bob.unsubscribe_from("alice").await?, SubscribeResult::Ok);
    assert_eq!(
        bob.unsubscribe_from("alice").await?,
        SubscribeResult::Unchanged
    );
    assert_eq!(
        bob.unsubscribe_from("ghost").await?,
        SubscribeResult::NotFound
    );

    server.stop()
}

#[tokio::test]
async fn listing_subscriptions() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let bob = make_test_client(&server, "bob").await?;
    let _alice = make_test_client(&server, "alice").await?;
    let _carol = make_test_client(&server, "carol").await?;

    assert!(bob.list_subscriptions().await?.is_empty());

    bob.subscribe_to("carol").await?;
    bob.subscribe_to("alice").await?;
    let names: Vec<String> = bob
        .list_subscriptions()
        .await?
        .iter()
        .map(Username::to_string)
        .collect();
    assert_eq!(names, ["carol", "alice"]);

    server.stop()
}

#[tokio::test]
async fn publish_reaches_author_and_online_followers() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut bob = make_test_client(&server, "bob").await?;
    let mut carol = make_test_client(&server, "carol").await?;
    let mut eve = make_test_client(&server, "eve").await?;

    assert_eq!(carol.subscribe_to("bob").await?, SubscribeResult::Ok);
    bob.publish("hello").await?;

    let echo = next_message(&mut bob).await?;
    assert_eq!(summary(&echo), "bob:hello");
    let live = next_message(&mut carol).await?;
    assert_eq!(live, echo);
    expect_quiet(&mut eve).await?;

    server.stop()
}

#[tokio::test]
async fn offline_followers_catch_up_in_order() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut alice = make_test_client(&server, "alice").await?;
    let mut bob = make_test_client(&server, "bob").await?;

    let dave = make_test_client(&server, "dave").await?;
    dave.subscribe_to("alice").await?;
    dave.subscribe_to("bob").await?;
    drop(dave);
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.publish("a1").await?;
    next_message(&mut alice).await?;
    bob.publish("b1").await?;
    next_message(&mut bob).await?;
    alice.publish("a2").await?;
    next_message(&mut alice).await?;

    let mut dave = make_test_client(&server, "dave").await?;
    let mut missed = Vec::new();
    for _ in 0..3 {
        missed.push(next_message(&mut dave).await?);
    }
    assert_eq!(
        missed.iter().map(summary).collect::<Vec<_>>(),
        ["alice:a1", "bob:b1", "alice:a2"]
    );
    assert!(missed.windows(2).all(|w| w[0].date < w[1].date));

    // nothing is replayed on the next login
    drop(dave);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut dave = make_test_client(&server, "dave").await?;
    expect_quiet(&mut dave).await?;

    server.stop()
}

#[tokio::test]
async fn catch_up_larger_than_the_pending_limit_is_delivered() -> anyhow::Result<()> {
    const MISSED: usize = 100;

    let storage = make_sqlite_store(":memory:")?;
    let alice = Username::try_from("alice")?;
    let dave = Username::try_from("dave")?;
    storage.record_presence(&alice, true)?;
    storage.record_presence(&dave, true)?;
    storage.follow(&dave, &alice)?;
    storage.record_presence(&dave, false)?;
    for i in 0..MISSED {
        storage.save_message(&alice, &Text::try_from(format!("m{i}").as_str())?)?;
    }

    let server = spawn_server(storage, ServerConfig::default().with_max_pending_frames(8))?;
    let mut dave = make_test_client(&server, "dave").await?;

    let mut missed = Vec::new();
    for _ in 0..MISSED {
        missed.push(summary(&next_message(&mut dave).await?));
    }
    let expected: Vec<String> = (0..MISSED).map(|i| format!("alice:m{i}")).collect();
    assert_eq!(missed, expected);

    // still connected and receiving live twiiiiits
    let mut alice = make_test_client(&server, "alice").await?;
    alice.publish("live").await?;
    next_message(&mut alice).await?;
    assert_eq!(summary(&next_message(&mut dave).await?), "alice:live");

    server.stop()
}

#[tokio::test]
async fn frames_split_across_writes_are_reassembled() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut stream = TcpStream::connect(server.addr).await?;
    stream.set_nodelay(true)?;

    let frame = ClientMessage::JoinAs(Username::try_from("slow")?).encode();
    for (i, byte) in frame.iter().enumerate() {
        stream.write_all(&[*byte]).await?;
        if i % 8 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::LoginStatus(LoginStatus::Ok)
    );
    server.stop()
}

#[tokio::test]
async fn back_to_back_frames_are_handled_in_order() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut stream = TcpStream::connect(server.addr).await?;

    let mut wire = Vec::new();
    wire.extend_from_slice(&ClientMessage::JoinAs(Username::try_from("fast")?).encode());
    wire.extend_from_slice(&ClientMessage::ListSubscriptions.encode());
    stream.write_all(&wire).await?;

    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::LoginStatus(LoginStatus::Ok)
    );
    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::END_OF_SUBSCRIPTIONS
    );
    server.stop()
}

#[tokio::test]
async fn malformed_frames_are_dropped_by_default() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut stream = TcpStream::connect(server.addr).await?;

    let mut garbage = [0u8; FRAME_LEN];
    garbage[3] = 42;
    stream.write_all(&garbage).await?;
    stream
        .write_all(&ClientMessage::JoinAs(Username::try_from("carl")?).encode())
        .await?;

    assert_eq!(
        read_frame(&mut stream).await?,
        ServerMessage::LoginStatus(LoginStatus::Ok)
    );
    server.stop()
}

#[tokio::test]
async fn shutdown_kicks_everyone_with_closing() -> anyhow::Result<()> {
    let server = make_test_server()?;
    let mut alice = make_test_client(&server, "alice").await?;
    let mut anon = Client::connect(server.addr).await?;
    // make sure the anonymous connection has been accepted
    assert_eq!(anon.join_as("").await?, LoginStatus::IllegalName);

    server.stop()?;

    for client in [&mut alice, &mut anon] {
        let event = tokio::time::timeout(EVENT_WAIT, client.next_event()).await?;
        assert_eq!(event, Some(ServerEvent::Kicked(KickReason::Closing)));
    }
    Ok(())
}

#[tokio::test]
async fn state_survives_restart() -> anyhow::Result<()> {
    let db = make_test_db()?;

    let server = spawn_server(make_sqlite_store(&db.path)?, ServerConfig::default())?;
    let bob = make_test_client(&server, "bob").await?;
    let _alice = make_test_client(&server, "alice").await?;
    bob.subscribe_to("alice").await?;
    server.stop()?;

    let server = spawn_server(make_sqlite_store(&db.path)?, ServerConfig::default())?;
    let mut alice = make_test_client(&server, "alice").await?;
    alice.publish("back").await?;
    next_message(&mut alice).await?;

    // bob was recorded offline by the first shutdown
    let mut bob = make_test_client(&server, "bob").await?;
    let names: Vec<String> = bob
        .list_subscriptions()
        .await?
        .iter()
        .map(Username::to_string)
        .collect();
    assert_eq!(names, ["alice"]);
    assert_eq!(summary(&next_message(&mut bob).await?), "alice:back");

    server.stop()
}
