//! Background serial polling.
//!
//! DAPLink buffers UART output from the target; the reader thread drains
//! it with SERIAL_READ and publishes it as text. It shares the session with
//! the rest of the connection through a mutex so its packets never
//! interleave with other command traffic.

use {
    super::events::{ConnectionEvent, EventBus},
    crate::{
        error::{DeviceError, Result},
        monitor::drain_utf8_lossy,
        target::Session,
        transport::Transport,
    },
    log::{debug, warn},
    std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, Ordering},
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Handle to the running serial reader thread.
pub(crate) struct SerialReader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SerialReader {
    /// Start polling `session` every `interval` while no data is pending.
    pub(crate) fn spawn<T: Transport + 'static>(
        session: Arc<Mutex<Session<T>>>,
        events: EventBus,
        interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_reader = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("microflash-serial".to_string())
            .spawn(move || read_loop(&session, &events, &running_reader, interval))?;
        debug!("Serial reader started");

        Ok(Self { running, handle })
    }

    /// Ask the thread to stop and wait for it.
    pub(crate) fn stop(self) {
        self.running
            .store(false, Ordering::Relaxed);
        if self
            .handle
            .join()
            .is_err()
        {
            warn!("Serial reader panicked");
        }
        debug!("Serial reader stopped");
    }
}

fn read_loop<T: Transport>(
    session: &Mutex<Session<T>>,
    events: &EventBus,
    running: &AtomicBool,
    interval: Duration,
) {
    let mut pending = Vec::new();

    while running.load(Ordering::Relaxed) {
        let chunk = match session.lock() {
            Ok(mut session) => session
                .dap_mut()
                .serial_read(),
            Err(_) => break,
        };

        match chunk {
            Ok(bytes) if bytes.is_empty() => thread::sleep(interval),
            Ok(bytes) => {
                pending.extend_from_slice(&bytes);
                let text = drain_utf8_lossy(&mut pending);
                if !text.is_empty() {
                    events.emit(ConnectionEvent::SerialData(text));
                }
            },
            Err(e) => {
                warn!("Serial read failed: {e}");
                events.emit(ConnectionEvent::SerialError(DeviceError::classify(&e)));
                break;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::DeviceErrorCode, transport::mock::connected_session},
        std::time::Instant,
    };

    fn next_event(rx: &std::sync::mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        rx.recv_timeout(Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_reader_publishes_text_across_split_utf8() {
        let (session, state) = connected_session();
        {
            let mut state = state
                .lock()
                .unwrap();
            state
                .serial_rx
                .push_back(vec![b'o', b'k', 0xC3]);
            state
                .serial_rx
                .push_back(vec![0xA9, b'\r', b'\n']);
        }
        let events = EventBus::default();
        let rx = events.subscribe();

        let reader = SerialReader::spawn(
            Arc::new(Mutex::new(session)),
            events,
            Duration::from_millis(1),
        )
        .unwrap();

        assert_eq!(next_event(&rx), ConnectionEvent::SerialData("ok".to_string()));
        assert_eq!(next_event(&rx), ConnectionEvent::SerialData("\u{e9}\r\n".to_string()));
        reader.stop();
    }

    #[test]
    fn test_reader_reports_error_and_exits() {
        let (session, state) = connected_session();
        state
            .lock()
            .unwrap()
            .unplugged = true;
        let events = EventBus::default();
        let rx = events.subscribe();

        let reader = SerialReader::spawn(
            Arc::new(Mutex::new(session)),
            events,
            Duration::from_millis(1),
        )
        .unwrap();

        match next_event(&rx) {
            ConnectionEvent::SerialError(e) => assert_eq!(e.code, DeviceErrorCode::DeviceDisconnected),
            other => panic!("unexpected event {other:?}"),
        }
        let start = Instant::now();
        reader.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
