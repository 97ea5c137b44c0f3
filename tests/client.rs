mod support;

use support::*;

use my_mini_redis_client::cmd::{Get, Incr, Set};
use my_mini_redis_client::{BlockingClient, Client, Command, Error, ErrorKind, Frame};
use std::time::Duration;

/// A PING PONG test without message provided.
/// It should return "PONG"
#[tokio::test]
async fn ping_pong_without_message() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    let pong = client.ping(None).await.unwrap();
    assert_eq!(b"PONG", &pong[..]);
}

/// A PING PONG test with message provided.
/// It should return the message.
#[tokio::test]
async fn ping_pong_with_message() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    let pong = client.ping(Some("你好世界".into())).await.unwrap();
    assert_eq!("你好世界".as_bytes(), &pong[..]);
}

#[tokio::test]
async fn key_value_get_set() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    client.set("foo", "bar".into()).await.unwrap();

    let value = client.get("foo").await.unwrap().unwrap();
    assert_eq!(b"bar", &value[..]);
    assert!(client.get("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn set_with_expiry() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    client
        .set_expires("ttl", "soon gone".into(), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(client.get("ttl").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.get("ttl").await.unwrap().is_none());
}

#[tokio::test]
async fn counters_and_delete() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    assert_eq!(client.incr("n").await.unwrap(), 1);
    assert_eq!(client.incr("n").await.unwrap(), 2);
    assert_eq!(client.del(&["n", "never-set"]).await.unwrap(), 1);
    assert!(client.get("n").await.unwrap().is_none());
}

/// An error reply is an application error; the connection stays usable.
#[tokio::test]
async fn application_error_keeps_the_connection() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();
    client.set("text", "abc".into()).await.unwrap();

    let mut conn = client.borrow().await.unwrap();
    let id = conn.id();
    let err = conn.execute(Incr::new("text").into_command()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Application);
    assert_eq!(err.to_string(), "ERR value is not an integer or out of range");

    let value = conn.execute(Get::new("text").into_command()).await.unwrap();
    assert_eq!(value, Frame::Bulk("abc".into()));
    drop(conn);

    // 连接被归还并复用
    let conn = client.borrow().await.unwrap();
    assert_eq!(conn.id(), id);
    assert_eq!(client.stats().discarded, 0);
}

#[tokio::test]
async fn pipelined_increments_arrive_in_order() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();

    let replies = client
        .pipeline(vec![
            Incr::new("counter").into_command(),
            Incr::new("counter").into_command(),
            Incr::new("counter").into_command(),
        ])
        .await
        .unwrap();

    assert_eq!(
        replies,
        vec![Frame::Integer(1), Frame::Integer(2), Frame::Integer(3)]
    );
}

#[tokio::test]
async fn pipeline_replies_match_request_order() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();
    let mut conn = client.borrow().await.unwrap();

    for n in [1usize, 2, 10] {
        let mut pipeline = conn.pipeline();
        for i in 0..n {
            pipeline.add(Command::new("ECHO").arg(format!("{}-{}", n, i)));
        }
        assert_eq!(pipeline.len(), n);

        let replies = pipeline.flush().await.unwrap();
        let expected: Vec<Frame> = (0..n)
            .map(|i| Frame::Bulk(format!("{}-{}", n, i).into()))
            .collect();
        assert_eq!(replies, expected);
        assert!(pipeline.is_empty());
    }
}

#[tokio::test]
async fn pipeline_keeps_error_replies_in_their_slot() {
    let server = start_server().await;
    let client = Client::connect(server.config()).await.unwrap();
    let mut conn = client.borrow().await.unwrap();

    let mut pipeline = conn.pipeline();
    pipeline.add(Set::new("word", "hi".into(), None).into_command());
    let bad = pipeline.queue(Incr::new("word").into_command(), Ok);
    let good = pipeline.queue(Get::new("word").into_command(), |frame| {
        frame
            .into_bytes()
            .ok_or_else(|| Error::Protocol("expected bulk".into()))
    });

    let replies = pipeline.flush().await.unwrap();
    assert_eq!(replies.len(), 3);
    assert!(replies[0].is_status("OK"));
    assert!(replies[1].is_error());

    assert_eq!(bad.take().unwrap_err().kind(), ErrorKind::Application);
    assert_eq!(&good.take().unwrap()[..], b"hi");
}

#[tokio::test]
async fn handshake_selects_database_and_names_the_client() {
    let server = start_server().await;
    let config = my_mini_redis_client::Config::new(server.endpoint().with_database(3))
        .with_client_name("reporting");
    let client = Client::connect(config).await.unwrap();
    client.set("k", "v".into()).await.unwrap();

    assert_eq!(server.client_names(), vec!["reporting".to_string()]);
    assert_eq!(server.selected_dbs(), vec![3]);
}

#[tokio::test]
async fn connect_from_url() {
    let server = start_server().await;
    let url = format!("redis://{}/0", server.addr);
    let client = Client::open(&url).await.unwrap();
    assert_eq!(&client.ping(None).await.unwrap()[..], b"PONG");

    assert!(Client::open("http://nope").await.is_err());
}

#[tokio::test]
async fn url_password_is_percent_decoded() {
    let server = start_server_with_password("p@ss").await;
    let url = format!("redis://:p%40ss@{}", server.addr);
    let client = Client::open(&url).await.unwrap();
    assert_eq!(&client.ping(None).await.unwrap()[..], b"PONG");
}

#[test]
fn blocking_client_round_trip() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(start_server());

    let client = BlockingClient::connect(server.config()).unwrap();
    client.set("foo", "bar".into()).unwrap();
    assert_eq!(&client.get("foo").unwrap().unwrap()[..], b"bar");

    let replies = client
        .pipeline(vec![
            Incr::new("hits").into_command(),
            Incr::new("hits").into_command(),
        ])
        .unwrap();
    assert_eq!(replies, vec![Frame::Integer(1), Frame::Integer(2)]);

    let mut tx = client.transaction().unwrap();
    let hits = tx.add(Incr::new("hits").into_command()).unwrap();
    tx.commit().unwrap();
    assert_eq!(hits.take().unwrap(), Frame::Integer(3));
}

#[test]
fn blocking_subscriber_iterates_messages() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = rt.block_on(start_server());

    let client = BlockingClient::connect(server.config()).unwrap();
    let subscriber = client.subscribe(&["news".to_string()]).unwrap();
    let handle = subscriber.handle();
    let mut messages = subscriber.into_iter();

    let publisher = client.clone();
    let waiter = std::thread::spawn(move || {
        for _ in 0..200 {
            if publisher.publish("news", "extra".into()).unwrap() == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("subscriber never showed up");
    });

    let message = messages.next().unwrap().unwrap();
    assert_eq!(message.channel, "news");
    assert_eq!(&message.content[..], b"extra");
    waiter.join().unwrap();

    handle.unsubscribe_all().unwrap();
    assert!(messages.next().is_none());
}
