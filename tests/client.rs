use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use redrive::{
    Client, ClientConfig, ClientError, CommandPayload, ConnectionState, FormattedCommand,
    ReplyStatus, RespValue, StateCallback,
};
use tracing_subscriber::EnvFilter;

static TRACING: std::sync::Once = std::sync::Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn spawn_server(
    expected_commands: usize,
    handler: fn(usize, Vec<Vec<u8>>, &mut TcpStream),
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
        for idx in 0..expected_commands {
            let args = match read_command(&mut reader) {
                Ok(args) => args,
                Err(_) => return,
            };
            handler(idx, args, &mut stream);
        }
        // Hold the connection open until the client hangs up.
        let mut sink = [0u8; 128];
        while let Ok(n) = reader.read(&mut sink) {
            if n == 0 {
                break;
            }
        }
    });

    addr
}

fn read_command(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line(reader: &mut BufReader<TcpStream>, buf: &mut Vec<u8>) -> std::io::Result<Option<()>> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Ok(None);
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(Some(()))
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    if data.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "empty"));
    }
    let mut value = 0usize;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"));
        }
        value = value.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    Ok(value)
}

fn write_simple(stream: &mut TcpStream, msg: &str) {
    let _ = stream.write_all(b"+");
    let _ = stream.write_all(msg.as_bytes());
    let _ = stream.write_all(b"\r\n");
    let _ = stream.flush();
}

fn write_error(stream: &mut TcpStream, msg: &str) {
    let _ = stream.write_all(b"-");
    let _ = stream.write_all(msg.as_bytes());
    let _ = stream.write_all(b"\r\n");
    let _ = stream.flush();
}

fn write_bulk(stream: &mut TcpStream, data: &[u8]) {
    let _ = stream.write_all(b"$");
    let _ = stream.write_all(data.len().to_string().as_bytes());
    let _ = stream.write_all(b"\r\n");
    let _ = stream.write_all(data);
    let _ = stream.write_all(b"\r\n");
    let _ = stream.flush();
}

fn write_nil(stream: &mut TcpStream) {
    let _ = stream.write_all(b"$-1\r\n");
    let _ = stream.flush();
}

fn write_integer(stream: &mut TcpStream, value: i64) {
    let _ = stream.write_all(b":");
    let _ = stream.write_all(value.to_string().as_bytes());
    let _ = stream.write_all(b"\r\n");
    let _ = stream.flush();
}

fn connected_client(addr: SocketAddr) -> Client {
    init_tracing();
    let client = Client::with_config(ClientConfig {
        connect_timeout: Duration::from_secs(1),
    });
    assert!(client.connect(addr.ip().to_string(), addr.port(), None));
    client
}

#[test]
fn blocking_del_set_get_roundtrip() {
    let addr = spawn_server(3, |idx, args, stream| match idx {
        0 => {
            assert_eq!(args[0], b"DEL");
            assert_eq!(args[1], b"occupation");
            write_integer(stream, 0);
        }
        1 => {
            assert_eq!(args[0], b"SET");
            assert_eq!(args[1], b"occupation");
            assert_eq!(args[2], b"carpenter");
            write_simple(stream, "OK");
        }
        _ => {
            assert_eq!(args[0], b"GET");
            write_bulk(stream, b"carpenter");
        }
    });

    let client = connected_client(addr);
    client.del("occupation");
    assert!(client.set("occupation", "carpenter"));
    assert_eq!(client.get("occupation").expect("get"), "carpenter");

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn async_callback_fires_exactly_once() {
    let addr = spawn_server(1, |_idx, args, stream| {
        assert_eq!(args[0], b"GET");
        write_bulk(stream, b"carpenter");
    });

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    client.command::<String>(["GET", "occupation"], move |command| {
        let _ = tx.send((command.status(), command.reply()));
    });

    let (status, reply) = rx.recv_timeout(Duration::from_secs(2)).expect("callback");
    assert_eq!(status, ReplyStatus::Ok);
    assert_eq!(reply.as_deref(), Some("carpenter"));
    // Exactly one message may arrive.
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    client.disconnect();
    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn pipelined_replies_match_submission_order() {
    let addr = spawn_server(2, |idx, args, stream| {
        assert_eq!(args[0], b"GET");
        if idx == 0 {
            write_bulk(stream, b"first");
        } else {
            write_bulk(stream, b"second");
        }
    });

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    client.command::<String>(["GET", "a"], move |command| {
        let _ = tx.send(command.reply());
    });
    client.command::<String>(["GET", "b"], move |command| {
        let _ = tx2.send(command.reply());
    });

    let first = rx.recv_timeout(Duration::from_secs(2)).expect("first");
    let second = rx.recv_timeout(Duration::from_secs(2)).expect("second");
    assert_eq!(first.as_deref(), Some("first"));
    assert_eq!(second.as_deref(), Some("second"));
    client.disconnect();
}

#[test]
fn server_error_reply_surfaces_message() {
    let addr = spawn_server(1, |_idx, _args, stream| {
        write_error(stream, "ERR wrong number of arguments");
    });

    let client = connected_client(addr);
    match client.get("occupation") {
        Err(ClientError::ErrorReply { message, .. }) => {
            assert_eq!(message, "ERR wrong number of arguments");
        }
        other => panic!("expected an error reply, got {other:?}"),
    }
    client.disconnect();
}

#[test]
fn mismatched_reply_type_reports_wrong_type() {
    let addr = spawn_server(1, |_idx, _args, stream| {
        write_bulk(stream, b"not a number");
    });

    let client = connected_client(addr);
    let command = client.command_sync::<i64>(["GET", "occupation"]);
    assert_eq!(command.status(), ReplyStatus::WrongType);
    assert_eq!(command.reply(), None);
    command.free();
    client.disconnect();
}

#[test]
fn nil_reply_decodes_as_none() {
    let addr = spawn_server(1, |_idx, _args, stream| {
        write_nil(stream);
    });

    let client = connected_client(addr);
    let command = client.command_sync::<Option<String>>(["GET", "missing"]);
    assert_eq!(command.status(), ReplyStatus::Ok);
    assert_eq!(command.reply(), Some(None));
    command.free();
    client.disconnect();
}

#[test]
fn formatted_command_is_sent_verbatim() {
    let addr = spawn_server(1, |_idx, args, stream| {
        assert_eq!(args[0], b"PING");
        write_simple(stream, "PONG");
    });

    let client = connected_client(addr);
    let formatted = FormattedCommand::from_args(["PING"]);
    let command = client.command_sync::<String>(CommandPayload::from(formatted));
    assert_eq!(command.reply().as_deref(), Some("PONG"));
    command.free();
    client.disconnect();
}

#[test]
fn delayed_command_waits_for_its_deadline() {
    let addr = spawn_server(1, |_idx, args, stream| {
        assert_eq!(args[0], b"PING");
        write_simple(stream, "PONG");
    });

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    let submitted = Instant::now();
    client.command_delayed::<String>(
        ["PING"],
        move |command| {
            let _ = tx.send(command.ok());
        },
        Duration::from_millis(50),
    );

    assert!(rx.recv_timeout(Duration::from_secs(2)).expect("callback"));
    assert!(submitted.elapsed() >= Duration::from_millis(50));
    client.disconnect();
}

#[test]
fn repeating_command_fires_every_cycle_until_freed() {
    let addr = spawn_server(16, |_idx, args, stream| {
        assert_eq!(args[0], b"PING");
        write_simple(stream, "PONG");
    });

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    let command = client.command_loop::<String>(
        ["PING"],
        move |command| {
            let _ = tx.send(command.ok());
        },
        Duration::from_millis(50),
    );

    // At least the initial send plus two repeats.
    for _ in 0..3 {
        assert!(rx.recv_timeout(Duration::from_secs(2)).expect("tick"));
    }

    command.free();
    client.disconnect();
    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn armed_delayed_command_resolves_send_error_on_disconnect() {
    let addr = spawn_server(0, |_idx, _args, _stream| {});

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    client.command_delayed::<String>(
        ["PING"],
        move |command| {
            let _ = tx.send(command.status());
        },
        Duration::from_millis(500),
    );

    // Stop well before the timer fires.
    thread::sleep(Duration::from_millis(50));
    client.disconnect();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("callback"),
        ReplyStatus::SendError
    );
    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn armed_repeating_command_resolves_send_error_on_disconnect() {
    let addr = spawn_server(0, |_idx, _args, _stream| {});

    let client = connected_client(addr);
    let (tx, rx) = mpsc::channel();
    let command = client.command_loop_after::<String>(
        ["PING"],
        move |command| {
            let _ = tx.send(command.status());
        },
        Duration::from_millis(500),
        Duration::from_millis(500),
    );

    thread::sleep(Duration::from_millis(50));
    client.disconnect();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("callback"),
        ReplyStatus::SendError
    );
    command.free();
    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn commands_after_disconnect_resolve_send_error() {
    let addr = spawn_server(1, |_idx, _args, stream| {
        write_simple(stream, "OK");
    });

    let client = connected_client(addr);
    assert!(client.set("occupation", "carpenter"));
    client.disconnect();

    let command = client.command_sync::<String>(["GET", "occupation"]);
    assert_eq!(command.status(), ReplyStatus::SendError);
    command.free();

    let (created, freed) = client.command_counts();
    assert_eq!(created, freed);
}

#[test]
fn remote_close_reports_disconnect_error() {
    init_tracing();
    // Server accepts and immediately hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        drop(stream);
    });

    let (tx, rx) = mpsc::channel();
    let client = Client::new();
    let states: StateCallback = Box::new(move |state| {
        let _ = tx.send(state);
    });
    assert!(client.connect(addr.ip().to_string(), addr.port(), Some(states)));

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("connected"),
        ConnectionState::Connected
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("closed"),
        ConnectionState::DisconnectError
    );
    let state = client.wait_for_state(ConnectionState::is_terminal);
    assert_eq!(state, ConnectionState::DisconnectError);
    client.wait();
}

#[test]
fn state_callback_sees_clean_shutdown() {
    init_tracing();
    let addr = spawn_server(0, |_idx, _args, _stream| {});

    let (tx, rx) = mpsc::channel();
    let client = Client::new();
    let states: StateCallback = Box::new(move |state| {
        let _ = tx.send(state);
    });
    assert!(client.connect(addr.ip().to_string(), addr.port(), Some(states)));
    client.disconnect();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("connected"),
        ConnectionState::Connected
    );
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("disconnected"),
        ConnectionState::Disconnected
    );
}

#[test]
fn raw_reply_values_pass_through() {
    let addr = spawn_server(1, |_idx, args, stream| {
        assert_eq!(args[0], b"TYPE");
        write_simple(stream, "string");
    });

    let client = connected_client(addr);
    let command = client.command_sync::<RespValue>(["TYPE", "occupation"]);
    assert_eq!(command.reply(), Some(RespValue::Simple(b"string".to_vec())));
    command.free();
    client.disconnect();
}
