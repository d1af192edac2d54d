//! One-shot task submission: hand the scheduler a task-file path and wait
//! for the admission verdict.

use crate::error::SwirlError;
use crate::protocol::{framed, send_message, OpCode, PAYLOAD_OK};
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Submit the task file at `task_file` (a path on the scheduler's
/// filesystem) and return whether the scheduler admitted it.
pub async fn submit_task(addr: &str, port: u16, task_file: &str) -> Result<bool, SwirlError> {
    let sockaddr: SocketAddr = format!("{}:{}", addr, port)
        .parse()
        .map_err(|_| SwirlError::BadAddress(format!("{}:{}", addr, port)))?;
    let stream = TcpStream::connect(sockaddr).await?;
    let (mut stream, mut sink) = framed(stream);

    send_message(&mut sink, OpCode::SubmitTask, task_file.as_bytes()).await?;

    match stream.next().await {
        None => Err(SwirlError::StreamClosed),
        Some(frame) => {
            let (head, body) = frame?;
            Ok(head.opcode() == OpCode::SubmitTaskRsp && &body[..] == PAYLOAD_OK)
        }
    }
}
