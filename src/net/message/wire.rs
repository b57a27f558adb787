use crate::{
    Result, TileMeshError,
    meta::{BoundingBox, LayerMeta, LayerStyle, LayerTms, TileFormat, TileMatrixMeta, TileMeta, TmsMeta},
};

use bytes::{Buf, BufMut, BytesMut};

const FORMAT_PNG: u8 = 0;
const FORMAT_JPEG: u8 = 1;

/// Field writer for message payloads. All integers are big-endian.
pub(crate) struct Writer<'a> {
    buf: &'a mut BytesMut,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(buf: &'a mut BytesMut) -> Self {
        Self { buf }
    }

    pub(crate) fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub(crate) fn u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub(crate) fn u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub(crate) fn f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub(crate) fn bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub(crate) fn string(&mut self, s: &str) -> Result<()> {
        let len = u16::try_from(s.len())
            .map_err(|_| TileMeshError::InvalidMessage(format!("String too long: {}", s.len())))?;
        self.buf.put_u16(len);
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }

    pub(crate) fn blob(&mut self, bytes: &[u8]) -> Result<()> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| TileMeshError::InvalidMessage(format!("Blob too long: {}", bytes.len())))?;
        self.buf.put_u32(len);
        self.buf.put_slice(bytes);
        Ok(())
    }

    fn count(&mut self, n: usize) -> Result<()> {
        let n = u16::try_from(n)
            .map_err(|_| TileMeshError::InvalidMessage(format!("List too long: {n}")))?;
        self.buf.put_u16(n);
        Ok(())
    }

    pub(crate) fn format(&mut self, format: TileFormat) {
        self.u8(match format {
            TileFormat::Png => FORMAT_PNG,
            TileFormat::Jpeg => FORMAT_JPEG,
        });
    }

    pub(crate) fn layer_tms(&mut self, v: &LayerTms) -> Result<()> {
        self.string(&v.layer)?;
        self.string(&v.tile_matrix_set)
    }

    pub(crate) fn layer_tms_list(&mut self, list: &[LayerTms]) -> Result<()> {
        self.count(list.len())?;
        list.iter().try_for_each(|v| self.layer_tms(v))
    }

    pub(crate) fn tile_meta(&mut self, meta: &TileMeta) -> Result<()> {
        self.string(&meta.layer)?;
        self.string(&meta.tile_matrix_set)?;
        self.string(&meta.tile_matrix)?;
        self.u32(meta.tile_row);
        self.u32(meta.tile_col);
        self.format(meta.format);
        Ok(())
    }

    pub(crate) fn layer_meta(&mut self, meta: Option<&LayerMeta>) -> Result<()> {
        let Some(meta) = meta else {
            self.bool(false);
            return Ok(());
        };

        self.bool(true);
        self.string(&meta.title)?;
        let b = meta.bounding_box;
        self.f64(b.min_x);
        self.f64(b.min_y);
        self.f64(b.max_x);
        self.f64(b.max_y);
        self.string(&meta.identifier)?;

        self.count(meta.styles.len())?;
        for style in &meta.styles {
            self.string(&style.identifier)?;
            self.bool(style.is_default);
        }

        self.count(meta.formats.len())?;
        for format in &meta.formats {
            self.format(*format);
        }
        Ok(())
    }

    pub(crate) fn tms_meta(&mut self, meta: Option<&TmsMeta>) -> Result<()> {
        let Some(meta) = meta else {
            self.bool(false);
            return Ok(());
        };

        self.bool(true);
        self.string(&meta.identifier)?;
        self.string(&meta.supported_crs)?;
        self.count(meta.tile_matrices.len())?;
        for m in &meta.tile_matrices {
            self.string(&m.identifier)?;
            self.f64(m.scale_denominator);
            self.f64(m.top_left_corner.0);
            self.f64(m.top_left_corner.1);
            self.u32(m.tile_width);
            self.u32(m.tile_height);
            self.u32(m.matrix_width);
            self.u32(m.matrix_height);
        }
        Ok(())
    }
}

/// Field reader over a message payload. Every read checks the remaining
/// length first, so a truncated payload is an error and never a panic.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        ensure!(
            self.buf.remaining() >= n,
            "Truncated {what}: need {n} bytes, have {}",
            self.buf.remaining()
        );
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        self.need(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    pub(crate) fn f64(&mut self) -> Result<f64> {
        self.need(8, "f64")?;
        Ok(self.buf.get_f64())
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => bail!("Invalid bool value: {other}"),
        }
    }

    fn count(&mut self) -> Result<usize> {
        self.need(2, "count")?;
        Ok(self.buf.get_u16() as usize)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        self.need(2, "string length")?;
        let len = self.buf.get_u16() as usize;
        self.need(len, "string")?;
        let s = std::str::from_utf8(&self.buf[..len])
            .map_err(|e| TileMeshError::InvalidMessage(format!("Invalid UTF-8 string: {e}")))?
            .to_string();
        self.buf.advance(len);
        Ok(s)
    }

    pub(crate) fn blob(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        self.need(len, "blob")?;
        let bytes = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(bytes)
    }

    pub(crate) fn format(&mut self) -> Result<TileFormat> {
        match self.u8()? {
            FORMAT_PNG => Ok(TileFormat::Png),
            FORMAT_JPEG => Ok(TileFormat::Jpeg),
            other => bail!("Unknown tile format: {other}"),
        }
    }

    pub(crate) fn layer_tms(&mut self) -> Result<LayerTms> {
        let layer = self.string()?;
        let tile_matrix_set = self.string()?;
        Ok(LayerTms {
            layer,
            tile_matrix_set,
        })
    }

    pub(crate) fn layer_tms_list(&mut self) -> Result<Vec<LayerTms>> {
        let n = self.count()?;
        (0..n).map(|_| self.layer_tms()).collect()
    }

    pub(crate) fn tile_meta(&mut self) -> Result<TileMeta> {
        Ok(TileMeta {
            layer: self.string()?,
            tile_matrix_set: self.string()?,
            tile_matrix: self.string()?,
            tile_row: self.u32()?,
            tile_col: self.u32()?,
            format: self.format()?,
        })
    }

    pub(crate) fn layer_meta(&mut self) -> Result<Option<LayerMeta>> {
        if !self.bool()? {
            return Ok(None);
        }

        let title = self.string()?;
        let bounding_box = BoundingBox {
            min_x: self.f64()?,
            min_y: self.f64()?,
            max_x: self.f64()?,
            max_y: self.f64()?,
        };
        let identifier = self.string()?;

        let n = self.count()?;
        let mut styles = Vec::with_capacity(n);
        for _ in 0..n {
            styles.push(LayerStyle {
                identifier: self.string()?,
                is_default: self.bool()?,
            });
        }

        let n = self.count()?;
        let formats = (0..n).map(|_| self.format()).collect::<Result<Vec<_>>>()?;

        Ok(Some(LayerMeta {
            title,
            bounding_box,
            identifier,
            styles,
            formats,
        }))
    }

    pub(crate) fn tms_meta(&mut self) -> Result<Option<TmsMeta>> {
        if !self.bool()? {
            return Ok(None);
        }

        let identifier = self.string()?;
        let supported_crs = self.string()?;
        let n = self.count()?;
        let mut tile_matrices = Vec::with_capacity(n);
        for _ in 0..n {
            tile_matrices.push(TileMatrixMeta {
                identifier: self.string()?,
                scale_denominator: self.f64()?,
                top_left_corner: (self.f64()?, self.f64()?),
                tile_width: self.u32()?,
                tile_height: self.u32()?,
                matrix_width: self.u32()?,
                matrix_height: self.u32()?,
            });
        }

        Ok(Some(TmsMeta {
            identifier,
            supported_crs,
            tile_matrices,
        }))
    }

    pub(crate) fn finish(self) -> Result<()> {
        ensure!(
            self.buf.is_empty(),
            "Trailing bytes after payload: {}",
            self.buf.len()
        );
        Ok(())
    }
}
