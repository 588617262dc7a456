use codot_bridge::{Bridge, BridgeConfig, ControlledProcess};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn launch() -> Bridge {
    let config = BridgeConfig {
        port: 0,
        relay_port: Some(0),
        game_port: 0,
        log_dir: String::new(),
        ..BridgeConfig::default()
    };
    Bridge::start(&config).await.expect("bridge start")
}

async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("websocket connect");
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("frame");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("json frame"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn send_raw(ws: &mut Client, raw: &str) -> Value {
    ws.send(Message::Text(raw.to_string())).await.expect("send");
    next_json(ws).await
}

async fn call(ws: &mut Client, id: Value, command: &str, params: Value) -> Value {
    let request = json!({"id": id, "command": command, "params": params});
    let response = send_raw(ws, &request.to_string()).await;
    assert_eq!(response["id"], id, "response must echo the request id");
    response
}

async fn connect_game(bridge: &Bridge) -> TcpStream {
    let stream = TcpStream::connect(bridge.game_addr())
        .await
        .expect("game connect");
    for _ in 0..100 {
        if bridge.game().is_running() {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("game session never registered");
}

async fn emit(game: &mut TcpStream, topic: &str, payload: Value) {
    let mut line = json!({"topic": topic, "payload": payload}).to_string();
    line.push('\n');
    game.write_all(line.as_bytes()).await.expect("game write");
    game.flush().await.expect("game flush");
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_round_trip_and_status() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;

    let response = call(&mut ws, json!("abc"), "ping", json!({})).await;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["result"]["pong"], json!(true));
    assert!(response.get("error").is_none());

    let status = call(&mut ws, json!(2), "get_status", json!({})).await;
    assert_eq!(status["result"]["port"], json!(bridge.control_addr().port()));
    assert_eq!(status["result"]["sessions"], json!(1));
    assert_eq!(status["result"]["game_running"], json!(false));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_errors_keep_the_connection_open() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;

    let parse = send_raw(&mut ws, "{\"id\": 1, ").await;
    assert_eq!(parse["id"], Value::Null);
    assert_eq!(parse["error"]["code"], json!("PARSE_ERROR"));

    let unknown = call(&mut ws, json!(7), "launch_rockets", json!({})).await;
    assert_eq!(unknown["success"], json!(false));
    assert_eq!(unknown["error"]["code"], json!("UNKNOWN_COMMAND"));

    let missing = send_raw(&mut ws, r#"{"params": {}}"#).await;
    assert_eq!(missing["id"], Value::Null);
    assert_eq!(missing["error"]["code"], json!("MISSING_COMMAND"));

    let no_id = send_raw(&mut ws, r#"{"command": "ping"}"#).await;
    assert_eq!(no_id["id"], Value::Null);
    assert_eq!(no_id["success"], json!(true));

    let not_running = call(&mut ws, json!(8), "ping_game", json!({})).await;
    assert_eq!(not_running["error"]["code"], json!("NOT_RUNNING"));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn game_output_is_queryable_and_clear_marks_it() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let mut game = connect_game(&bridge).await;

    emit(&mut game, "codot:ready", json!({"pid": 4242})).await;
    emit(&mut game, "codot:entry", json!({"type": "print", "message": "hello"})).await;
    emit(&mut game, "codot:entry", json!({"type": "error", "message": "bad index", "line": 3})).await;

    let mut errors = Value::Null;
    for attempt in 0..50 {
        errors = call(
            &mut ws,
            json!(attempt),
            "get_debug_output",
            json!({"filter": "error", "since_id": 0}),
        )
        .await;
        if errors["result"]["count"] == json!(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(errors["result"]["entries"][0]["message"], json!("bad index"));
    assert_eq!(errors["result"]["entries"][0]["source"], json!("controlled-process"));

    let cleared = call(&mut ws, json!("clear"), "clear_debug_log", json!({})).await;
    let cursor = cleared["result"]["since_id"].clone();
    let after = call(&mut ws, json!("after"), "get_debug_output", json!({})).await;
    assert_eq!(after["result"]["count"], json!(0));
    assert_eq!(after["result"]["marker"], cursor);

    let state = call(&mut ws, json!("state"), "get_game_state", json!({})).await;
    assert_eq!(state["result"]["running"], json!(true));
    assert_eq!(state["result"]["capture_active"], json!(true));
    assert_eq!(bridge.bus().marker(), cursor.as_u64().expect("cursor"));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_output_is_satisfied_by_the_game() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let mut game = connect_game(&bridge).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        emit(&mut game, "codot:entry", json!({"type": "warning", "message": "low fps"})).await;
        emit(&mut game, "codot:entry", json!({"type": "error", "message": "boss crashed"})).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let response = call(
        &mut ws,
        json!("wait"),
        "wait_for_output",
        json!({"wait_for": "error", "timeout": 5, "poll_interval": 0.05}),
    )
    .await;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["result"]["found"], json!(true));
    assert_eq!(response["result"]["entry"]["message"], json!("boss crashed"));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_wait_does_not_block_other_requests() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let _game = connect_game(&bridge).await;

    let wait = json!({"id": "slow", "command": "wait_for_output", "params": {"timeout": 1, "wait_for": "never printed"}});
    ws.send(Message::Text(wait.to_string())).await.expect("send wait");
    let ping = json!({"id": "fast", "command": "ping"});
    ws.send(Message::Text(ping.to_string())).await.expect("send ping");

    let first = next_json(&mut ws).await;
    let second = next_json(&mut ws).await;
    assert_eq!(first["id"], json!("fast"));
    assert_eq!(second["id"], json!("slow"));
    assert_eq!(second["result"]["timeout"], json!(true));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn game_disconnect_ends_an_in_flight_wait() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let game = connect_game(&bridge).await;

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(game);
    });
    let response = call(
        &mut ws,
        json!("w"),
        "wait_for_output",
        json!({"timeout": 30, "poll_interval": 0.05}),
    )
    .await;
    assert_eq!(response["result"]["found"], json!(false));
    assert_eq!(response["result"]["reason"], json!("game_stopped"));
    assert!(response["result"]["elapsed"].as_f64().expect("elapsed") < 5.0);

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_game_round_trips_through_the_side_channel() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let game = connect_game(&bridge).await;

    tokio::spawn(async move {
        let (reader, mut writer) = game.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).expect("bridge frame");
            if frame["topic"] == json!("codot:ping") {
                let reply = json!({"topic": "codot:pong", "payload": {"id": frame["payload"]["id"]}});
                let mut out = reply.to_string();
                out.push('\n');
                if writer.write_all(out.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });

    let response = call(&mut ws, json!(1), "ping_game", json!({"timeout": 3})).await;
    assert_eq!(response["result"]["responded"], json!(true));
    assert!(response["result"]["latency_ms"].as_u64().is_some());

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relay_forwards_prompts_to_the_other_peer() {
    let bridge = launch().await;
    let relay_addr = bridge.relay_addr().expect("relay enabled");
    let mut editor = connect(relay_addr).await;
    let mut tool = connect(relay_addr).await;

    let mut delivered = Value::Null;
    for attempt in 0..50 {
        delivered = call(
            &mut editor,
            json!(attempt),
            "send_prompt",
            json!({"prompt": "add a jump sound"}),
        )
        .await;
        if delivered["result"]["recipients"] == json!(1) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(delivered["result"]["delivered"], json!(true));

    let prompt = next_json(&mut tool).await;
    assert_eq!(prompt["type"], json!("prompt"));
    assert_eq!(prompt["prompt"], json!("add a jump sound"));

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_closes_clients_and_game_sessions() {
    let bridge = launch().await;
    let mut ws = connect(bridge.control_addr()).await;
    let _ = call(&mut ws, json!(1), "ping", json!({})).await;
    let _game = connect_game(&bridge).await;

    bridge.stop().await;
    bridge.stop().await;

    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close should arrive");
    assert!(matches!(next, Some(Ok(Message::Close(_))) | Some(Err(_)) | None));
    for _ in 0..100 {
        if !bridge.game().is_running() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("game session survived shutdown");
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_capture_ignores_the_game_but_keeps_host_prints() {
    let config = BridgeConfig {
        port: 0,
        relay_port: None,
        game_port: 0,
        log_dir: String::new(),
        capture_enabled: false,
        ..BridgeConfig::default()
    };
    let bridge = Bridge::start(&config).await.expect("bridge start");
    let mut ws = connect(bridge.control_addr()).await;
    let mut game = connect_game(&bridge).await;
    emit(&mut game, "codot:entry", json!({"type": "error", "message": "ignored"})).await;

    let printed = call(&mut ws, json!(1), "print_to_console", json!({"message": "hi"})).await;
    assert_eq!(printed["result"]["id"], json!(1));

    let state = call(&mut ws, json!(2), "get_game_state", json!({})).await;
    assert_eq!(state["result"]["running"], json!(true));
    assert_eq!(state["result"]["capture_enabled"], json!(false));
    assert_eq!(bridge.bus().last_id(), 1);

    bridge.stop().await;
}
