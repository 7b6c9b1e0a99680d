//! Session orchestration: one call per client connection, returning only once
//! every task it started has finished and every stream it opened is closed.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::Message;
use entry_core::{ResponseMessage, ResponseType};
use futures_util::StreamExt;
use metrics::counter;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    heartbeat::{run_heartbeat, DEFAULT_HEARTBEAT_INTERVAL},
    pipe::{pipe, DEFAULT_PIPE_CAPACITY},
    relay::{
        relay_output, relay_requests, ClientWriter, FrameStream, RelayOutcome, ResizeTarget,
        OUTPUT_BUFFER_SIZE,
    },
    runtime::{AttachStreams, ContainerRuntime, ExecSpec, ExecStreams},
};

pub const BYEBYE_MSG: &str = "\x1b[32m>>> You quit the container safely.\x1b[0m";
pub const ENTER_ERROR_MSG: &str = "\x1b[31m>>> Can't enter your container, try again.\x1b[0m";
pub const ATTACH_ERROR_MSG: &str = "\x1b[31m>>> Can't attach your container, try again.\x1b[0m";

const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub heartbeat_interval: Duration,
    /// Pause before the first client frame is relayed, so the exec is
    /// attached when the initial resize arrives.
    pub attach_delay: Duration,
    /// How long the input relay gets to see the client's close reply.
    pub close_grace: Duration,
    pub output_buffer_size: usize,
    pub pipe_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            attach_delay: Duration::from_secs(1),
            close_grace: Duration::from_secs(5),
            output_buffer_size: OUTPUT_BUFFER_SIZE,
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Identifies the session in logs.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub session_id: Uuid,
    pub container_id: String,
}

/// Runs an interactive shell in the container until it exits or the client
/// goes away.
pub async fn enter(
    runtime: Arc<dyn ContainerRuntime>,
    writer: ClientWriter,
    frames: FrameStream,
    target: &SessionTarget,
    term_type: &str,
    config: &BridgeConfig,
) {
    let SessionTarget {
        session_id,
        container_id,
    } = target;

    let exec_id = match runtime
        .create_exec(container_id, ExecSpec::shell(term_type))
        .await
    {
        Ok(exec_id) => exec_id,
        Err(err) => {
            warn!(%session_id, %container_id, error = %err, "create exec failed");
            counter!("entry_setup_failures_total", 1, "mode" => "enter");
            send_close(&writer, ENTER_ERROR_MSG, session_id).await;
            return;
        }
    };
    info!(%session_id, %container_id, %exec_id, term_type, "exec created");

    let (stdin_writer, mut stdin_reader) = pipe(config.pipe_capacity);
    let (mut stdout_writer, stdout_reader) = pipe(config.pipe_capacity);
    let (mut stderr_writer, stderr_reader) = pipe(config.pipe_capacity);

    let (stop_beacon, beacon_stop) = oneshot::channel();
    let beacon = tokio::spawn(run_heartbeat(
        writer.clone(),
        config.heartbeat_interval,
        beacon_stop,
    ));

    let mut inbound = tokio::spawn(relay_requests(
        frames,
        stdin_writer,
        writer.codec(),
        ResizeTarget {
            runtime: Arc::clone(&runtime),
            exec_id: exec_id.clone(),
        },
        config.attach_delay,
    ));
    let stdout_relay = tokio::spawn(relay_output(
        stdout_reader,
        writer.clone(),
        ResponseType::Stdout,
        config.output_buffer_size,
    ));
    let stderr_relay = tokio::spawn(relay_output(
        stderr_reader,
        writer.clone(),
        ResponseType::Stderr,
        config.output_buffer_size,
    ));

    let result = runtime
        .start_exec(
            &exec_id,
            ExecStreams {
                stdin: &mut stdin_reader,
                stdout: &mut stdout_writer,
                stderr: &mut stderr_writer,
            },
        )
        .await;

    stdout_writer.close();
    stderr_writer.close();
    stdin_reader.close();

    join_relay(stdout_relay, "stdout", session_id).await;
    join_relay(stderr_relay, "stderr", session_id).await;

    let farewell = match &result {
        Ok(()) => BYEBYE_MSG,
        Err(err) => {
            warn!(%session_id, %exec_id, error = %err, "exec ended with error");
            ENTER_ERROR_MSG
        }
    };
    send_close(&writer, farewell, session_id).await;
    if let Err(err) = writer.close().await {
        debug!(%session_id, error = %err, "close frame not delivered");
    }

    match tokio::time::timeout(config.close_grace, &mut inbound).await {
        Ok(joined) => log_outcome(joined, "input", session_id),
        Err(_) => {
            debug!(%session_id, "client did not close in time; aborting input relay");
            inbound.abort();
            let _ = inbound.await;
        }
    }

    let _ = stop_beacon.send(());
    let _ = beacon.await;
    info!(%session_id, %container_id, %exec_id, "enter session finished");
}

/// Streams the container's output to the client without an input path, until
/// the client disconnects.
pub async fn attach(
    runtime: Arc<dyn ContainerRuntime>,
    writer: ClientWriter,
    mut frames: FrameStream,
    target: &SessionTarget,
    config: &BridgeConfig,
) {
    let SessionTarget {
        session_id,
        container_id,
    } = target;

    let (stdout_writer, stdout_reader) = pipe(config.pipe_capacity);
    let (stderr_writer, stderr_reader) = pipe(config.pipe_capacity);

    let waiter = match runtime
        .attach(
            container_id,
            AttachStreams {
                stdout: stdout_writer,
                stderr: stderr_writer,
            },
        )
        .await
    {
        Ok(waiter) => waiter,
        Err(err) => {
            warn!(%session_id, %container_id, error = %err, "attach container failed");
            counter!("entry_setup_failures_total", 1, "mode" => "attach");
            send_close(&writer, ATTACH_ERROR_MSG, session_id).await;
            return;
        }
    };
    info!(%session_id, %container_id, "container attached");

    let stdout_relay = tokio::spawn(relay_output(
        stdout_reader,
        writer.clone(),
        ResponseType::Stdout,
        config.output_buffer_size,
    ));
    let stderr_relay = tokio::spawn(relay_output(
        stderr_reader,
        writer.clone(),
        ResponseType::Stderr,
        config.output_buffer_size,
    ));

    // client frames carry nothing in attach mode, they only tell us it is alive
    loop {
        match frames.next().await {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
            Some(Ok(_)) => {}
        }
        tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
    }
    debug!(%session_id, "attach client went away");

    waiter.close().await;
    join_relay(stdout_relay, "stdout", session_id).await;
    join_relay(stderr_relay, "stderr", session_id).await;
    info!(%session_id, %container_id, "attach session finished");
}

async fn send_close(writer: &ClientWriter, message: &str, session_id: &Uuid) {
    if let Err(err) = writer.send(&ResponseMessage::close(message)).await {
        debug!(%session_id, error = %err, "close message not delivered");
    }
}

async fn join_relay(relay: JoinHandle<RelayOutcome>, stream: &str, session_id: &Uuid) {
    log_outcome(relay.await, stream, session_id);
}

fn log_outcome(
    joined: Result<RelayOutcome, tokio::task::JoinError>,
    stream: &str,
    session_id: &Uuid,
) {
    match joined {
        Ok(RelayOutcome::Finished) => debug!(%session_id, stream, "relay finished"),
        Ok(RelayOutcome::Failed(err)) => debug!(%session_id, stream, error = %err, "relay failed"),
        Err(err) => warn!(%session_id, stream, error = %err, "relay task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        relay::FrameSink,
        runtime::{AttachWaiter, RuntimeError},
    };
    use async_trait::async_trait;
    use entry_core::{Codec, RequestMessage};
    use futures::{channel::mpsc, SinkExt};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct ScriptedRuntime {
        fail_create: bool,
        fail_start: bool,
        fail_attach: bool,
        /// Read stdin until EOF instead of a single five byte line.
        read_to_eof: bool,
        output: Vec<u8>,
        stdin_seen: Mutex<Vec<u8>>,
        stdin_ended: Mutex<bool>,
        resizes: Mutex<Vec<(u16, u16)>>,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn create_exec(&self, _: &str, spec: ExecSpec) -> Result<String, RuntimeError> {
            assert_eq!(spec.cmd[0], "env");
            if self.fail_create {
                return Err(RuntimeError::Other("no such container".into()));
            }
            Ok("exec-1".into())
        }

        async fn start_exec(&self, _: &str, streams: ExecStreams<'_>) -> Result<(), RuntimeError> {
            if self.read_to_eof {
                let mut input = Vec::new();
                streams.stdin.read_to_end(&mut input).await?;
                self.stdin_seen.lock().unwrap().extend_from_slice(&input);
                *self.stdin_ended.lock().unwrap() = true;
                return Ok(());
            }
            let mut line = [0u8; 5];
            streams.stdin.read_exact(&mut line).await?;
            self.stdin_seen.lock().unwrap().extend_from_slice(&line);
            streams.stdout.write_all(&self.output).await?;
            streams.stderr.write_all(b"warn\n").await?;
            if self.fail_start {
                return Err(RuntimeError::Other("exec stream broke".into()));
            }
            Ok(())
        }

        async fn resize_exec(&self, _: &str, height: u16, width: u16) -> Result<(), RuntimeError> {
            self.resizes.lock().unwrap().push((width, height));
            Ok(())
        }

        async fn attach(&self, _: &str, streams: AttachStreams) -> Result<AttachWaiter, RuntimeError> {
            if self.fail_attach {
                return Err(RuntimeError::Other("gone".into()));
            }
            let output = self.output.clone();
            let pump = tokio::spawn(async move {
                let AttachStreams { mut stdout, .. } = streams;
                let _ = stdout.write_all(&output).await;
                std::future::pending::<()>().await;
            });
            Ok(AttachWaiter::new(pump))
        }
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            attach_delay: Duration::ZERO,
            close_grace: Duration::from_millis(200),
            ..BridgeConfig::default()
        }
    }

    fn target() -> SessionTarget {
        SessionTarget {
            session_id: Uuid::new_v4(),
            container_id: "c1".into(),
        }
    }

    fn channel_writer(codec: Codec) -> (ClientWriter, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();
        let sink: FrameSink = Box::pin(tx.sink_map_err(axum::Error::new));
        (ClientWriter::new(sink, codec), rx)
    }

    fn responses(codec: Codec, rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ResponseMessage> {
        let mut out = Vec::new();
        while let Ok(Some(frame)) = rx.try_next() {
            if let Message::Binary(bytes) = frame {
                out.push(codec.decode(&bytes).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn failed_exec_creation_sends_a_single_close() {
        let runtime = Arc::new(ScriptedRuntime {
            fail_create: true,
            ..Default::default()
        });
        let (writer, mut rx) = channel_writer(Codec::Binary);
        let frames: FrameStream = Box::pin(futures::stream::pending::<Result<Message, axum::Error>>());

        enter(runtime, writer, frames, &target(), "xterm", &test_config()).await;

        let sent = responses(Codec::Binary, &mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind().unwrap(), ResponseType::Close);
        assert_eq!(sent[0].content, ENTER_ERROR_MSG.as_bytes());
    }

    #[tokio::test]
    async fn enter_relays_then_says_goodbye_last() {
        let runtime = Arc::new(ScriptedRuntime {
            output: "bonjour ☃\n".as_bytes().to_vec(),
            ..Default::default()
        });
        let codec = Codec::Text;
        let (writer, mut rx) = channel_writer(codec);
        let (mut client_tx, client_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();
        client_tx
            .send(Ok(Message::Binary(
                codec.encode(&RequestMessage::winch(80, 24)).unwrap(),
            )))
            .await
            .unwrap();
        client_tx
            .send(Ok(Message::Binary(
                codec.encode(&RequestMessage::plain("exit\n")).unwrap(),
            )))
            .await
            .unwrap();

        let bridge_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
        let session = tokio::spawn(async move {
            enter(
                bridge_runtime,
                writer,
                Box::pin(client_rx),
                &target(),
                "xterm",
                &test_config(),
            )
            .await
        });
        session.await.unwrap();
        drop(client_tx);

        assert_eq!(*runtime.stdin_seen.lock().unwrap(), b"exit\n");
        assert_eq!(*runtime.resizes.lock().unwrap(), vec![(80, 24)]);

        let mut frames = Vec::new();
        let mut saw_close_frame = false;
        while let Ok(Some(frame)) = rx.try_next() {
            match frame {
                Message::Binary(bytes) => frames.push(codec.decode::<ResponseMessage>(&bytes).unwrap()),
                Message::Close(_) => saw_close_frame = true,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_close_frame);

        let data: Vec<&ResponseMessage> = frames
            .iter()
            .filter(|m| m.kind().unwrap() != ResponseType::Ping)
            .collect();
        let last = data.last().unwrap();
        assert_eq!(last.kind().unwrap(), ResponseType::Close);
        assert_eq!(last.content, BYEBYE_MSG.as_bytes());
        assert_eq!(
            data.iter()
                .filter(|m| m.kind().unwrap() == ResponseType::Close)
                .count(),
            1
        );

        let stdout: Vec<u8> = data
            .iter()
            .filter(|m| m.kind().unwrap() == ResponseType::Stdout)
            .flat_map(|m| m.content.clone())
            .collect();
        assert_eq!(stdout, "bonjour ☃\n".as_bytes());
        assert!(data
            .iter()
            .any(|m| m.kind().unwrap() == ResponseType::Stderr && m.content == b"warn\n"));
    }

    #[tokio::test]
    async fn exec_error_sends_error_close_after_output() {
        let runtime = Arc::new(ScriptedRuntime {
            fail_start: true,
            output: b"partial\n".to_vec(),
            ..Default::default()
        });
        let codec = Codec::Binary;
        let (writer, mut rx) = channel_writer(codec);
        let (mut client_tx, client_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();
        client_tx
            .send(Ok(Message::Binary(
                codec.encode(&RequestMessage::plain("exit\n")).unwrap(),
            )))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            enter(
                runtime,
                writer,
                Box::pin(client_rx),
                &target(),
                "xterm",
                &test_config(),
            ),
        )
        .await
        .expect("enter must return once the exec fails");

        let data: Vec<ResponseMessage> = responses(codec, &mut rx)
            .into_iter()
            .filter(|m| m.kind().unwrap() != ResponseType::Ping)
            .collect();
        let (last, rest) = data.split_last().unwrap();
        assert_eq!(last.kind().unwrap(), ResponseType::Close);
        assert_eq!(last.content, ENTER_ERROR_MSG.as_bytes());
        assert!(rest.iter().all(|m| m.kind().unwrap() != ResponseType::Close));
        let stdout: Vec<u8> = rest
            .iter()
            .filter(|m| m.kind().unwrap() == ResponseType::Stdout)
            .flat_map(|m| m.content.clone())
            .collect();
        assert_eq!(stdout, b"partial\n");
    }

    #[tokio::test]
    async fn client_disconnect_ends_enter() {
        let runtime = Arc::new(ScriptedRuntime {
            read_to_eof: true,
            ..Default::default()
        });
        let codec = Codec::Text;
        let (writer, mut rx) = channel_writer(codec);
        let (mut client_tx, client_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();
        client_tx
            .send(Ok(Message::Binary(
                codec.encode(&RequestMessage::plain("top\n")).unwrap(),
            )))
            .await
            .unwrap();

        let bridge_runtime: Arc<dyn ContainerRuntime> = runtime.clone();
        let session = tokio::spawn(async move {
            enter(
                bridge_runtime,
                writer,
                Box::pin(client_rx),
                &target(),
                "xterm",
                &test_config(),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_finished());

        // the socket goes away without a close frame
        drop(client_tx);
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("enter must return after the client disconnects")
            .unwrap();

        assert!(*runtime.stdin_ended.lock().unwrap());
        assert_eq!(*runtime.stdin_seen.lock().unwrap(), b"top\n");
        let closes = responses(codec, &mut rx)
            .into_iter()
            .filter(|m| m.kind().unwrap() == ResponseType::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn failed_attach_sends_a_single_close() {
        let runtime = Arc::new(ScriptedRuntime {
            fail_attach: true,
            ..Default::default()
        });
        let (writer, mut rx) = channel_writer(Codec::Binary);
        let frames: FrameStream = Box::pin(futures::stream::pending::<Result<Message, axum::Error>>());

        attach(runtime, writer, frames, &target(), &test_config()).await;

        let sent = responses(Codec::Binary, &mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, ATTACH_ERROR_MSG.as_bytes());
    }

    #[tokio::test]
    async fn attach_streams_until_client_leaves() {
        let runtime = Arc::new(ScriptedRuntime {
            output: b"log line\n".to_vec(),
            ..Default::default()
        });
        let (writer, mut rx) = channel_writer(Codec::Binary);
        let (mut client_tx, client_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();

        let session = tokio::spawn(async move {
            attach(runtime, writer, Box::pin(client_rx), &target(), &test_config()).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        client_tx
            .send(Ok(Message::Text("ignored".into())))
            .await
            .unwrap();
        client_tx.send(Ok(Message::Close(None))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("attach must return after the client closes")
            .unwrap();

        let sent = responses(Codec::Binary, &mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind().unwrap(), ResponseType::Stdout);
        assert_eq!(sent[0].content, b"log line\n");
    }
}
