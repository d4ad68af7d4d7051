mod session_test;

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;

use crate::config::SessionConfig;
use crate::mock::MockRemote;
use crate::protocol::{Frame, frame_type};

pub(crate) fn test_config() -> SessionConfig {
    // Long ping interval so heartbeats never interleave with frame
    // assertions; the heartbeat test builds its own config.
    SessionConfig::builder()
        .host("localhost")
        .port(9000)
        .secure(false)
        .ping_interval(Duration::from_secs(60))
        .build()
}

pub(crate) async fn within<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(5), fut)
        .await
        .expect("test timed out")
}

/// Next non-heartbeat frame the client sent.
pub(crate) async fn recv_signal_frame(remote: &mut MockRemote) -> Frame {
    loop {
        let frame = within(remote.recv_frame()).await.expect("client frame");
        if frame.kind != frame_type::HEARTBEAT {
            return frame;
        }
    }
}
