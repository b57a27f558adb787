macro_rules! bail {
    ($msg:expr) => {
        return Err(TileMeshError::InvalidMessage(format!($msg)))
    };
    ($msg:expr, $($arg:tt)*) => {
        return Err(TileMeshError::InvalidMessage(format!($msg, $($arg)*)))
    };
}

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            bail!($($arg)+);
        }
    };
}

pub(crate) mod wire;

use crate::{
    Result, TileMeshError,
    meta::{LayerMeta, LayerTms, TileMeta, TmsMeta},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use wire::{Reader, Writer};

const LENGTH_SIZE: usize = 4;

/// Upper bound for a single frame. Tile bytes travel in chunks far below this.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

const MESSAGE_ID_CLOSE: u8 = 0;
const MESSAGE_ID_PING: u8 = 1;
const MESSAGE_ID_PONG: u8 = 2;
const MESSAGE_ID_LIST_LAYERS: u8 = 3;
const MESSAGE_ID_LIST_LAYERS_REPLY: u8 = 4;
const MESSAGE_ID_DESCRIBE_LAYER: u8 = 5;
const MESSAGE_ID_DESCRIBE_LAYER_REPLY: u8 = 6;
const MESSAGE_ID_DESCRIBE_TMS: u8 = 7;
const MESSAGE_ID_DESCRIBE_TMS_REPLY: u8 = 8;
const MESSAGE_ID_TILE_SIZE: u8 = 9;
const MESSAGE_ID_TILE_SIZE_REPLY: u8 = 10;
const MESSAGE_ID_GET_TILE_CHUNK: u8 = 11;
const MESSAGE_ID_TILE_CHUNK_REPLY: u8 = 12;
const MESSAGE_ID_HAVE: u8 = 13;
const MESSAGE_ID_REPLY: u8 = 14;
const MESSAGE_ID_WANT: u8 = 15;
const MESSAGE_ID_START_DATA: u8 = 16;
const MESSAGE_ID_DATA: u8 = 17;
const MESSAGE_ID_PEER_ID: u8 = 18;

pub trait AsBytes {
    fn as_bytes(&self) -> Result<Bytes>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Close,
    Ping,
    Pong,
    ListLayers,
    ListLayersReply(Vec<LayerTms>),
    DescribeLayer(String),
    DescribeLayerReply(Option<LayerMeta>),
    DescribeTileMatrixSet(String),
    DescribeTileMatrixSetReply(Option<TmsMeta>),
    TileSize(TileMeta),
    /// Zero means the tile is not available.
    TileSizeReply(u64),
    GetTileChunk {
        meta: TileMeta,
        offset: u64,
        limit: u32,
    },
    TileChunkReply(Vec<u8>),
    Have(TileMeta),
    Reply(bool),
    Want(TileMeta),
    StartData(u64),
    Data(Vec<u8>),
    PeerId(String),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Close => "Close",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::ListLayers => "ListLayers",
            Self::ListLayersReply(_) => "ListLayersReply",
            Self::DescribeLayer(_) => "DescribeLayer",
            Self::DescribeLayerReply(_) => "DescribeLayerReply",
            Self::DescribeTileMatrixSet(_) => "DescribeTileMatrixSet",
            Self::DescribeTileMatrixSetReply(_) => "DescribeTileMatrixSetReply",
            Self::TileSize(_) => "TileSize",
            Self::TileSizeReply(_) => "TileSizeReply",
            Self::GetTileChunk { .. } => "GetTileChunk",
            Self::TileChunkReply(_) => "TileChunkReply",
            Self::Have(_) => "Have",
            Self::Reply(_) => "Reply",
            Self::Want(_) => "Want",
            Self::StartData(_) => "StartData",
            Self::Data(_) => "Data",
            Self::PeerId(_) => "PeerId",
        }
    }

    fn id(&self) -> u8 {
        match self {
            Self::Close => MESSAGE_ID_CLOSE,
            Self::Ping => MESSAGE_ID_PING,
            Self::Pong => MESSAGE_ID_PONG,
            Self::ListLayers => MESSAGE_ID_LIST_LAYERS,
            Self::ListLayersReply(_) => MESSAGE_ID_LIST_LAYERS_REPLY,
            Self::DescribeLayer(_) => MESSAGE_ID_DESCRIBE_LAYER,
            Self::DescribeLayerReply(_) => MESSAGE_ID_DESCRIBE_LAYER_REPLY,
            Self::DescribeTileMatrixSet(_) => MESSAGE_ID_DESCRIBE_TMS,
            Self::DescribeTileMatrixSetReply(_) => MESSAGE_ID_DESCRIBE_TMS_REPLY,
            Self::TileSize(_) => MESSAGE_ID_TILE_SIZE,
            Self::TileSizeReply(_) => MESSAGE_ID_TILE_SIZE_REPLY,
            Self::GetTileChunk { .. } => MESSAGE_ID_GET_TILE_CHUNK,
            Self::TileChunkReply(_) => MESSAGE_ID_TILE_CHUNK_REPLY,
            Self::Have(_) => MESSAGE_ID_HAVE,
            Self::Reply(_) => MESSAGE_ID_REPLY,
            Self::Want(_) => MESSAGE_ID_WANT,
            Self::StartData(_) => MESSAGE_ID_START_DATA,
            Self::Data(_) => MESSAGE_ID_DATA,
            Self::PeerId(_) => MESSAGE_ID_PEER_ID,
        }
    }

    /// Decodes one complete frame, length prefix included. Used for datagrams,
    /// where a frame must fill the whole packet.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        ensure!(frame.len() > LENGTH_SIZE, "Frame too short: {}", frame.len());

        let length = u32_from_bytes(frame) as usize;
        let body = &frame[LENGTH_SIZE..];
        ensure!(
            length == body.len(),
            "Length prefix {length} does not match frame body {}",
            body.len()
        );

        Message::try_from(body)
    }

    fn write_payload(&self, w: &mut Writer<'_>) -> Result<()> {
        match self {
            Self::Close | Self::Ping | Self::Pong | Self::ListLayers => {}
            Self::ListLayersReply(layers) => w.layer_tms_list(layers)?,
            Self::DescribeLayer(id) | Self::DescribeTileMatrixSet(id) | Self::PeerId(id) => {
                w.string(id)?
            }
            Self::DescribeLayerReply(meta) => w.layer_meta(meta.as_ref())?,
            Self::DescribeTileMatrixSetReply(meta) => w.tms_meta(meta.as_ref())?,
            Self::TileSize(meta) | Self::Have(meta) | Self::Want(meta) => w.tile_meta(meta)?,
            Self::TileSizeReply(size) | Self::StartData(size) => w.u64(*size),
            Self::GetTileChunk {
                meta,
                offset,
                limit,
            } => {
                w.tile_meta(meta)?;
                w.u64(*offset);
                w.u32(*limit);
            }
            Self::TileChunkReply(bytes) | Self::Data(bytes) => w.blob(bytes)?,
            Self::Reply(reply) => w.bool(*reply),
        }
        Ok(())
    }
}

impl AsBytes for Message {
    fn as_bytes(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        body.put_u8(self.id());
        self.write_payload(&mut Writer::new(&mut body))?;

        ensure!(
            body.len() <= MAX_FRAME_SIZE,
            "{} frame too large: {}",
            self.name(),
            body.len()
        );

        let mut bytes = BytesMut::with_capacity(LENGTH_SIZE + body.len());
        bytes.put_u32(body.len() as u32);
        bytes.extend_from_slice(&body);
        Ok(bytes.freeze())
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = TileMeshError;

    /// Decodes a frame body: discriminator followed by payload.
    fn try_from(bytes: &[u8]) -> Result<Self> {
        ensure!(!bytes.is_empty(), "Message too short");

        let id = bytes[0];
        let mut r = Reader::new(&bytes[1..]);

        let msg = match id {
            MESSAGE_ID_CLOSE => Message::Close,
            MESSAGE_ID_PING => Message::Ping,
            MESSAGE_ID_PONG => Message::Pong,
            MESSAGE_ID_LIST_LAYERS => Message::ListLayers,
            MESSAGE_ID_LIST_LAYERS_REPLY => Message::ListLayersReply(r.layer_tms_list()?),
            MESSAGE_ID_DESCRIBE_LAYER => Message::DescribeLayer(r.string()?),
            MESSAGE_ID_DESCRIBE_LAYER_REPLY => Message::DescribeLayerReply(r.layer_meta()?),
            MESSAGE_ID_DESCRIBE_TMS => Message::DescribeTileMatrixSet(r.string()?),
            MESSAGE_ID_DESCRIBE_TMS_REPLY => Message::DescribeTileMatrixSetReply(r.tms_meta()?),
            MESSAGE_ID_TILE_SIZE => Message::TileSize(r.tile_meta()?),
            MESSAGE_ID_TILE_SIZE_REPLY => Message::TileSizeReply(r.u64()?),
            MESSAGE_ID_GET_TILE_CHUNK => Message::GetTileChunk {
                meta: r.tile_meta()?,
                offset: r.u64()?,
                limit: r.u32()?,
            },
            MESSAGE_ID_TILE_CHUNK_REPLY => Message::TileChunkReply(r.blob()?),
            MESSAGE_ID_HAVE => Message::Have(r.tile_meta()?),
            MESSAGE_ID_REPLY => Message::Reply(r.bool()?),
            MESSAGE_ID_WANT => Message::Want(r.tile_meta()?),
            MESSAGE_ID_START_DATA => Message::StartData(r.u64()?),
            MESSAGE_ID_DATA => Message::Data(r.blob()?),
            MESSAGE_ID_PEER_ID => Message::PeerId(r.string()?),
            _ => bail!("Unknown message ID: {id}"),
        };

        r.finish()?;
        Ok(msg)
    }
}

/// Length-delimited framing of [`Message`] for stream sockets.
#[derive(Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = TileMeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < LENGTH_SIZE {
            return Ok(None);
        }

        let length = u32_from_bytes(src) as usize;
        ensure!(length > 0, "Empty frame");
        ensure!(length <= MAX_FRAME_SIZE, "Frame too large: {length}");

        if src.len() < LENGTH_SIZE + length {
            src.reserve(LENGTH_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_SIZE);
        let body = src.split_to(length);
        Message::try_from(body.as_ref()).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = TileMeshError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&msg.as_bytes()?);
        Ok(())
    }
}

fn u32_from_bytes(bytes: &[u8]) -> u32 {
    let mut array = [0u8; LENGTH_SIZE];
    array.copy_from_slice(&bytes[0..LENGTH_SIZE]);
    u32::from_be_bytes(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{BoundingBox, LayerStyle, TileFormat, TileMatrixMeta};

    fn tile() -> TileMeta {
        TileMeta {
            layer: "base".to_string(),
            tile_matrix_set: "WebMercator".to_string(),
            tile_matrix: "2".to_string(),
            tile_row: 1,
            tile_col: 1,
            format: TileFormat::Png,
        }
    }

    fn all_messages() -> Vec<Message> {
        let layer = LayerMeta {
            title: "Base map".to_string(),
            bounding_box: BoundingBox {
                min_x: -180.0,
                min_y: -85.05,
                max_x: 180.0,
                max_y: 85.05,
            },
            identifier: "base".to_string(),
            styles: vec![LayerStyle::default()],
            formats: vec![TileFormat::Png, TileFormat::Jpeg],
        };
        let tms = TmsMeta {
            identifier: "WebMercator".to_string(),
            supported_crs: "urn:ogc:def:crs:EPSG::3857".to_string(),
            tile_matrices: vec![TileMatrixMeta {
                identifier: "0".to_string(),
                scale_denominator: 559082264.0287178,
                top_left_corner: (-20037508.3427892, 20037508.3427892),
                tile_width: 256,
                tile_height: 256,
                matrix_width: 1,
                matrix_height: 1,
            }],
        };

        vec![
            Message::Close,
            Message::Ping,
            Message::Pong,
            Message::ListLayers,
            Message::ListLayersReply(vec![]),
            Message::ListLayersReply(vec![
                LayerTms::new("base", "WebMercator"),
                LayerTms::new("relief", "WorldCRS84Quad"),
            ]),
            Message::DescribeLayer("base".to_string()),
            Message::DescribeLayerReply(Some(layer)),
            Message::DescribeLayerReply(None),
            Message::DescribeTileMatrixSet("WebMercator".to_string()),
            Message::DescribeTileMatrixSetReply(Some(tms)),
            Message::DescribeTileMatrixSetReply(None),
            Message::TileSize(tile()),
            Message::TileSizeReply(0),
            Message::TileSizeReply(3000),
            Message::GetTileChunk {
                meta: tile(),
                offset: 4096,
                limit: 4096,
            },
            Message::TileChunkReply(vec![]),
            Message::TileChunkReply(vec![0xAB; 4096]),
            Message::Have(tile()),
            Message::Reply(true),
            Message::Reply(false),
            Message::Want(tile()),
            Message::StartData(3000),
            Message::Data(vec![]),
            Message::Data((0..=255).cycle().take(1024).collect()),
            Message::PeerId("5f2c9a01be".to_string()),
        ]
    }

    #[test]
    fn test_decode_encoded() {
        for msg in all_messages() {
            let bytes = msg.as_bytes().unwrap();
            assert_eq!(Message::decode(&bytes).unwrap(), msg, "{}", msg.name());
        }
    }

    #[test]
    fn test_frame_layout() {
        let bytes = Message::Reply(true).as_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 2, MESSAGE_ID_REPLY, 1]);

        let bytes = Message::Close.as_bytes().unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 1, MESSAGE_ID_CLOSE]);
    }

    #[test]
    fn test_unknown_id() {
        let err = Message::decode(&[0, 0, 0, 1, 200]).unwrap_err();
        assert!(matches!(err, TileMeshError::InvalidMessage(_)));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = Message::Want(tile()).as_bytes().unwrap();
        let mut cut = bytes[..bytes.len() - 3].to_vec();
        let length = (cut.len() - LENGTH_SIZE) as u32;
        cut[..LENGTH_SIZE].copy_from_slice(&length.to_be_bytes());

        let err = Message::decode(&cut).unwrap_err();
        assert!(matches!(err, TileMeshError::InvalidMessage(_)));
    }

    #[test]
    fn test_trailing_bytes() {
        assert!(Message::decode(&[0, 0, 0, 2, MESSAGE_ID_PING, 7]).is_err());
        assert!(Message::decode(&[0, 0, 0, 5, MESSAGE_ID_PING]).is_err());
        assert!(Message::decode(&[0, 0, 0, 2, MESSAGE_ID_REPLY, 2]).is_err());
    }

    #[test]
    fn test_codec_stream() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::StartData(3000), &mut buf).unwrap();
        codec.encode(Message::Data(vec![1, 2, 3]), &mut buf).unwrap();

        let mut partial = buf.split_to(6);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(buf);

        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::StartData(3000))
        );
        assert_eq!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::Data(vec![1, 2, 3]))
        );
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_largest_blob() {
        // id + blob length prefix
        let largest = MAX_FRAME_SIZE - 1 - 4;
        let blob: Vec<u8> = (0..=255).cycle().take(largest).collect();

        for msg in [Message::Data(blob.clone()), Message::TileChunkReply(blob.clone())] {
            let bytes = msg.as_bytes().unwrap();
            assert_eq!(bytes.len(), LENGTH_SIZE + MAX_FRAME_SIZE);
            assert_eq!(Message::decode(&bytes).unwrap(), msg);

            let mut buf = BytesMut::new();
            MessageCodec.encode(msg.clone(), &mut buf).unwrap();
            assert_eq!(MessageCodec.decode(&mut buf).unwrap(), Some(msg));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_oversized_blob() {
        let blob = vec![7u8; MAX_FRAME_SIZE - 4];

        for msg in [Message::Data(blob.clone()), Message::TileChunkReply(blob.clone())] {
            let err = msg.as_bytes().unwrap_err();
            assert!(matches!(err, TileMeshError::InvalidMessage(_)));

            let mut buf = BytesMut::new();
            assert!(MessageCodec.encode(msg, &mut buf).is_err());
            assert!(buf.is_empty());
        }

        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_SIZE as u32 + 1);
        buf.put_u8(MESSAGE_ID_DATA);
        let err = MessageCodec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TileMeshError::InvalidMessage(_)));
    }
}
