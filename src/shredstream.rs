//! Upstream shred-stream gRPC client.
//!
//! The source service exposes a single server-streaming RPC delivering the
//! reassembled entries of each slot as `{ slot, entries }` frames. The
//! message types and client below follow the shape `tonic-build` generates
//! for that service.

use std::fmt;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeEntriesRequest {}

/// One frame: every entry reassembled for a slot, serialized back to back.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Entry {
    #[prost(uint64, tag = "1")]
    pub slot: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub entries: ::prost::alloc::vec::Vec<u8>,
}

/// Connection lifecycle surfaced by the stream supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    Connected,
    Disconnected,
    Error { code: i32, detail: String },
    MaxReconnectAttemptsReached,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamState::Connected => write!(f, "connected"),
            StreamState::Disconnected => write!(f, "disconnected"),
            StreamState::Error { code, detail } => write!(f, "error({code}): {detail}"),
            StreamState::MaxReconnectAttemptsReached => {
                write!(f, "max reconnect attempts reached")
            }
        }
    }
}

pub mod shredstream_client {
    #![allow(unused_variables, dead_code, missing_docs, clippy::let_unit_value)]
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct ShredstreamProxyClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl ShredstreamProxyClient<tonic::transport::Channel> {
        /// Attempt to create a new client by connecting to a given endpoint.
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }

    impl<T> ShredstreamProxyClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }

        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.inner = self.inner.max_decoding_message_size(limit);
            self
        }

        pub async fn subscribe_entries(
            &mut self,
            request: impl tonic::IntoRequest<super::SubscribeEntriesRequest>,
        ) -> std::result::Result<
            tonic::Response<tonic::codec::Streaming<super::Entry>>,
            tonic::Status,
        > {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static(
                "/shredstream.ShredstreamProxy/SubscribeEntries",
            );
            let mut req = request.into_request();
            req.extensions_mut().insert(GrpcMethod::new(
                "shredstream.ShredstreamProxy",
                "SubscribeEntries",
            ));
            self.inner.server_streaming(req, path, codec).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn entry_frame_round_trips() {
        let frame = Entry {
            slot: 312_555_901,
            entries: vec![1, 2, 3, 4, 5],
        };
        let bytes = frame.encode_to_vec();
        let decoded = Entry::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn stream_states_render() {
        assert_eq!(StreamState::Connected.to_string(), "connected");
        let err = StreamState::Error {
            code: 14,
            detail: "unavailable".into(),
        };
        assert_eq!(err.to_string(), "error(14): unavailable");
    }
}
