//! Async client for the framed request protocol.

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::{MetashopError, Result};
use crate::protocol::frame::{read_frame, write_frame, FrameRead};
use crate::protocol::schema::{
    decode_response, encode_request, PricePair, ProductEntry, Request, Response,
};
use crate::types::{ImageData, ProductId};

const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub struct MetashopClient {
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl MetashopClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Send one raw payload and return the raw response payload.
    pub async fn request_raw(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        write_frame(&mut self.stream, payload).await?;
        match read_frame(&mut self.stream, self.max_frame_bytes).await? {
            FrameRead::Frame(body) => Ok(body.to_vec()),
            FrameRead::Closed | FrameRead::TimedOut => Err(MetashopError::ConnectionClosed),
        }
    }

    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        let body = encode_request(request)?;
        let reply = self.request_raw(&body).await?;
        decode_response(&reply)
    }

    pub async fn identify(&mut self, images: Vec<ImageData>) -> Result<Vec<ProductEntry>> {
        match self.request(&Request::Identify { images }).await? {
            Response::Identify { products } => Ok(products),
            other => Err(unexpected(other)),
        }
    }

    pub async fn price_check(&mut self, ids: &[ProductId]) -> Result<Vec<PricePair>> {
        let metashop_ids = ids.iter().map(ToString::to_string).collect();
        match self.request(&Request::PriceCheck { metashop_ids }).await? {
            Response::PriceCheck { prices } => Ok(prices),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> MetashopError {
    match response {
        Response::Error { reason } => MetashopError::Remote(reason),
        other => MetashopError::MalformedResponse(format!("unexpected response: {other:?}")),
    }
}
