//! Moves requests between client connections and work items.

use foxy_protocol::service::{ServiceBatch, ServiceResponse};
use foxy_protocol::tcp::{TcpRequest, TcpRequestParser, render_response};
use foxy_protocol::{ErrorCode, ResponseLine};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::dispatcher::Rejected;
use crate::error::FoxyError;
use crate::work::{Origin, Routing, WorkItem, WorkResult};

const READ_CHUNK: usize = 4096;

/// Read one request. Stops at the request terminator or end of stream.
pub async fn read_request<R>(reader: &mut R) -> Result<TcpRequest, FoxyError>
where
    R: AsyncRead + Unpin,
{
    let mut parser = TcpRequestParser::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("client closed its side before the request terminator");
            break;
        }
        if parser.push(&buf[..n]) {
            break;
        }
    }
    Ok(parser.finish()?)
}

/// Work item for a TCP request, answered on the primary channel.
pub fn tcp_work_item(request: TcpRequest, stream: TcpStream) -> WorkItem {
    match request {
        TcpRequest::Batch {
            reader,
            password,
            commands,
        } => WorkItem::process(reader, password, commands, Origin::Tcp(stream), Routing::Primary),
        TcpRequest::SelectTerminal { name, max_readers } => {
            WorkItem::select_terminal(name, max_readers, Origin::Tcp(stream), Routing::Primary)
        }
    }
}

/// Work item for a service request, answered on the alternate channel.
pub fn service_work_item(batch: ServiceBatch) -> WorkItem {
    WorkItem::process(
        batch.reader,
        batch.password,
        batch.commands,
        Origin::Service,
        Routing::Alternate,
    )
}

/// Write `lines` in one go and close the connection.
pub async fn write_tcp_response(mut stream: TcpStream, lines: &[ResponseLine]) {
    let payload = render_response(lines);
    if let Err(err) = stream.write_all(payload.as_bytes()).await {
        warn!("writing response failed: {err}");
    }
    if let Err(err) = stream.shutdown().await {
        debug!("closing connection failed: {err}");
    }
}

/// Answer the client a result belongs to.
pub async fn deliver(result: WorkResult) {
    match result.origin {
        Origin::Tcp(stream) => write_tcp_response(stream, &result.lines).await,
        Origin::Service => {
            warn!(
                worker = result.worker_id,
                ticket = result.ticket,
                "service result arrived on the primary channel, dropped"
            );
        }
    }
}

/// Answer a rejected submission with one error line per command.
pub async fn reject(rejected: Rejected) {
    let code = rejected.error.to_error_code();
    let Some(item) = rejected.item else {
        warn!("rejected work is gone: {}", rejected.error);
        return;
    };
    debug!(reader = %item.reader, %code, "submission rejected: {}", rejected.error);
    if let Origin::Tcp(stream) = item.origin {
        write_tcp_response(stream, &ResponseLine::error_for(&item.commands, code)).await;
    }
}

pub fn service_response(result: WorkResult) -> ServiceResponse {
    ServiceResponse::new(result.lines)
}

/// One `code` line per command of `batch`.
pub fn service_error(batch: &ServiceBatch, code: ErrorCode) -> ServiceResponse {
    ServiceResponse::new(ResponseLine::error_for(&batch.commands, code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use foxy_protocol::Command;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn request_split_across_reads() {
        let (mut client, mut server) = duplex(8);
        let writer = tokio::spawn(async move {
            client
                .write_all(b">T1:1234|\n>1:SIGN:abcd|\n>2:CHAIN|\n\n")
                .await
                .expect("write");
            client
        });
        let request = read_request(&mut server).await.expect("request");
        let _client = writer.await.expect("writer");

        let TcpRequest::Batch {
            reader,
            password,
            commands,
        } = request
        else {
            panic!("expected batch");
        };
        assert_eq!(reader, "T1");
        assert_eq!(password.as_deref(), Some("1234"));
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].data.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn end_of_stream_accepts_complete_batch_only() {
        let (mut client, mut server) = duplex(64);
        client.write_all(b">T1|\n>1:RESET|\n").await.expect("write");
        drop(client);
        assert!(read_request(&mut server).await.is_ok());

        let (mut client, mut server) = duplex(64);
        client.write_all(b">T1|\n").await.expect("write");
        drop(client);
        let err = read_request(&mut server).await.expect_err("no commands");
        assert_eq!(err.to_error_code(), ErrorCode::WrongData);
    }

    #[tokio::test]
    async fn rejected_tcp_request_gets_error_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.expect("connect");
            let mut reply = String::new();
            stream.read_to_string(&mut reply).await.expect("read");
            reply
        });
        let (stream, _) = listener.accept().await.expect("accept");

        let item = WorkItem::process(
            "nobody",
            None,
            vec![Command::new("1", "SIGN"), Command::new("2", "CHAIN")],
            Origin::Tcp(stream),
            Routing::Primary,
        );
        reject(Rejected {
            error: FoxyError::ReaderNotFound("nobody".into()),
            item: Some(item),
        })
        .await;

        assert_eq!(
            client.await.expect("client"),
            ">1:ReaderNotFound#\n>2:ReaderNotFound#\n"
        );
    }

    #[test]
    fn service_errors_cover_every_command() {
        let batch = ServiceBatch {
            reader: "alice".into(),
            password: None,
            commands: vec![Command::new("7", "SIGN"), Command::new("8", "CHAIN")],
        };
        let response = service_error(&batch, ErrorCode::VagueName);
        assert_eq!(
            response.response,
            vec![
                ResponseLine::new("7", "VagueName"),
                ResponseLine::new("8", "VagueName")
            ]
        );
    }
}
