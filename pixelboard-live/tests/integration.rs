//! Integration tests for the WebSocket board server.
//!
//! These tests start a real server and connect real clients, verifying
//! reads, writes, rejection and the change stream end to end.

use pixelboard_live::client::BoardClient;
use pixelboard_live::context::CanvasContext;
use pixelboard_live::protocol::{ProtocolError, RejectReason};
use pixelboard_live::server::{BoardServer, ServerConfig};
use pixelboard_live::PixelChange;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};

/// Start a volatile server on a free port, return its URL and shared state.
async fn start_test_server(width: u32, height: u32) -> (String, Arc<CanvasContext>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = BoardServer::new(ServerConfig::for_testing(width, height)).unwrap();
    let ctx = server.context().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });

    (format!("ws://127.0.0.1:{port}"), ctx)
}

/// Collect change batches until `count` changes have arrived.
async fn collect_changes(client: &mut BoardClient, count: usize) -> Vec<PixelChange> {
    let mut received = Vec::new();
    while received.len() < count {
        let batch = client.next_changes(Duration::from_secs(2)).await.unwrap();
        assert!(!batch.is_empty(), "Empty batches must not be sent");
        received.extend(batch);
    }
    received
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (url, _) = start_test_server(4, 4).await;

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_settings_report_board() {
    let (url, _) = start_test_server(640, 480).await;
    let mut client = BoardClient::connect(&url).await.unwrap();

    let settings = client.settings().await.unwrap();
    assert_eq!(settings.width, 640);
    assert_eq!(settings.height, 480);
    assert_eq!(settings.palette.len(), 2);
    assert_eq!(settings.palette.resolve(1).hex, 0xFFFFFF);
}

#[tokio::test]
async fn test_write_then_read_range() {
    let (url, ctx) = start_test_server(4, 4).await;
    let mut client = BoardClient::connect(&url).await.unwrap();

    client.color_pixel(3, 2, 1).await.unwrap();

    let pixels = client.read_range(0, 0, 4, 4).await.unwrap();
    assert_eq!(pixels.len(), 16);
    // row-major: (3, 2) is index 2 * 4 + 3
    assert_eq!((pixels[11].x, pixels[11].y), (3, 2));
    assert_eq!(pixels[11].color.hex, 0xFFFFFF);
    assert_eq!(pixels[11].color.color_id, 1);
    assert!(pixels.iter().enumerate().all(|(i, p)| i == 11 || p.color.color_id == 0));

    assert_eq!(ctx.board.cell(3, 2).unwrap().color_index, 1);
}

#[tokio::test]
async fn test_read_full_width_row() {
    let (url, _) = start_test_server(8, 8).await;
    let mut client = BoardClient::connect(&url).await.unwrap();

    client.color_pixel(7, 7, 1).await.unwrap();
    let pixels = client.read_range(0, 7, 8, 8).await.unwrap();
    assert_eq!(pixels.len(), 8);
    assert_eq!(pixels[7].color.color_id, 1);
}

#[tokio::test]
async fn test_invalid_requests_rejected() {
    let (url, ctx) = start_test_server(10, 10).await;
    let mut client = BoardClient::connect(&url).await.unwrap();

    match client.color_pixel(10, 0, 1).await {
        Err(ProtocolError::Rejected { reason, .. }) => assert_eq!(reason, RejectReason::OutOfBounds),
        other => panic!("Expected OutOfBounds rejection, got {other:?}"),
    }
    match client.color_pixel(0, 0, 2).await {
        Err(ProtocolError::Rejected { reason, .. }) => assert_eq!(reason, RejectReason::InvalidColor),
        other => panic!("Expected InvalidColor rejection, got {other:?}"),
    }
    match client.read_range(5, 0, 2, 3).await {
        Err(ProtocolError::Rejected { reason, .. }) => assert_eq!(reason, RejectReason::InvalidRange),
        other => panic!("Expected InvalidRange rejection, got {other:?}"),
    }
    match client.read_range(0, 0, 11, 1).await {
        Err(ProtocolError::Rejected { reason, .. }) => assert_eq!(reason, RejectReason::InvalidRange),
        other => panic!("Expected InvalidRange rejection, got {other:?}"),
    }

    // Connection still usable and nothing was committed
    client.ping().await.unwrap();
    assert_eq!(ctx.board.pending_len(), 0);
}

#[tokio::test]
async fn test_subscribers_receive_changes_in_order() {
    let (url, _) = start_test_server(16, 16).await;

    let mut alice = BoardClient::connect(&url).await.unwrap();
    let mut bob = BoardClient::connect(&url).await.unwrap();
    let alice_id = alice.subscribe().await.unwrap();
    let bob_id = bob.subscribe().await.unwrap();
    assert_ne!(alice_id, bob_id);

    let mut writer = BoardClient::connect(&url).await.unwrap();
    writer.color_pixel(1, 1, 1).await.unwrap();
    writer.color_pixel(2, 3, 1).await.unwrap();
    writer.color_pixel(1, 1, 0).await.unwrap();

    let expected = vec![
        PixelChange { x: 1, y: 1, color_index: 1 },
        PixelChange { x: 2, y: 3, color_index: 1 },
        PixelChange { x: 1, y: 1, color_index: 0 },
    ];
    assert_eq!(collect_changes(&mut alice, 3).await, expected);
    assert_eq!(collect_changes(&mut bob, 3).await, expected);
}

#[tokio::test]
async fn test_writer_can_subscribe_on_same_connection() {
    let (url, _) = start_test_server(8, 8).await;
    let mut client = BoardClient::connect(&url).await.unwrap();

    let id = client.subscribe().await.unwrap();
    assert_eq!(client.subscribe().await.unwrap(), id, "Subscribing twice keeps one subscription");
    assert_eq!(client.subscriber_id(), Some(id));

    client.color_pixel(4, 4, 1).await.unwrap();
    client.color_pixel(5, 5, 1).await.unwrap();

    let changes = collect_changes(&mut client, 2).await;
    assert_eq!(changes[0], PixelChange { x: 4, y: 4, color_index: 1 });
    assert_eq!(changes[1], PixelChange { x: 5, y: 5, color_index: 1 });
}

#[tokio::test]
async fn test_unsubscribed_client_receives_nothing() {
    let (url, ctx) = start_test_server(8, 8).await;
    let mut listener = BoardClient::connect(&url).await.unwrap();
    listener.subscribe().await.unwrap();
    listener.unsubscribe().await.unwrap();
    // Idempotent
    listener.unsubscribe().await.unwrap();
    assert_eq!(ctx.hub.subscriber_count().await, 0);

    let mut writer = BoardClient::connect(&url).await.unwrap();
    writer.color_pixel(0, 0, 1).await.unwrap();

    let result = listener.next_changes(Duration::from_millis(200)).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)), "Got {result:?}");
}

#[tokio::test]
async fn test_disconnect_removes_subscription() {
    let (url, ctx) = start_test_server(8, 8).await;
    let mut client = BoardClient::connect(&url).await.unwrap();
    client.subscribe().await.unwrap();
    assert_eq!(ctx.hub.subscriber_count().await, 1);

    client.close().await.unwrap();

    timeout(Duration::from_secs(2), async {
        while ctx.hub.subscriber_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Subscription should be dropped after disconnect");
}

#[tokio::test]
async fn test_concurrent_writers_all_delivered() {
    let (url, ctx) = start_test_server(20, 20).await;
    let mut listener = BoardClient::connect(&url).await.unwrap();
    listener.subscribe().await.unwrap();

    let mut tasks = Vec::new();
    for row in 0..4u32 {
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            let mut client = BoardClient::connect(&url).await.unwrap();
            for x in 0..20 {
                client.color_pixel(x, row, 1).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let changes = collect_changes(&mut listener, 80).await;
    assert_eq!(changes.len(), 80);
    for row in 0..4u32 {
        // Each writer's changes keep their order within the stream
        let xs: Vec<u32> = changes.iter().filter(|c| c.y == row).map(|c| c.x).collect();
        assert_eq!(xs, (0..20).collect::<Vec<_>>());
    }

    let pixels = ctx.board.read_range(0, 0, 20, 4).unwrap();
    assert!(pixels.iter().all(|c| c.color_index == 1));
}

#[tokio::test]
async fn test_server_stats() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(BoardServer::new(ServerConfig::for_testing(4, 4)).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });

    let mut client = BoardClient::connect(&format!("ws://127.0.0.1:{port}")).await.unwrap();
    client.color_pixel(0, 0, 1).await.unwrap();
    let _ = client.color_pixel(9, 9, 1).await;
    client.ping().await.unwrap();

    let stats = server.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_messages, 3);
    assert_eq!(stats.pixels_written, 1);
    assert_eq!(stats.requests_rejected, 1);
}

#[tokio::test]
async fn test_serve_until_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server = BoardServer::new(ServerConfig::for_testing(4, 4)).unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        server
            .serve_until(listener, async {
                let _ = rx.await;
            })
            .await
    });

    tx.send(()).unwrap();
    let result = timeout(Duration::from_secs(2), handle).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}
