use crate::capture::{CapturedFrame, PixelLayout};
use crate::encoder::frame_pool::FramePool;
use crate::encoder::{EncodeError, EncoderOutput, EncoderParams, FrameEncoder};
use crate::pipeline::types::{MediaPacket, TimeBase};
use ac_ffmpeg::codec::Encoder;
use ac_ffmpeg::codec::video::scaler::{Algorithm, VideoFrameScaler};
use ac_ffmpeg::codec::video::{self, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::time::{self, Timestamp};
use bytes::Bytes;

/// Encoder candidates, software first. The V4L2 mem2mem encoder covers
/// boards without a usable libx264 build.
const ENCODER_CHAIN: &[&str] = &["libx264", "h264_v4l2m2m"];

const TARGET_PIXEL_FORMAT: &str = "yuv420p";

fn encoder_options(codec: &str, params: &EncoderParams) -> Vec<(&'static str, String)> {
    let mut options = vec![("g", params.gop().to_string()), ("bf", "0".to_string())];
    if codec == "libx264" {
        options.push(("preset", "ultrafast".to_string()));
        options.push(("tune", "zerolatency".to_string()));
    }
    options
}

/// Scaler from the current capture layout to the encoder's format.
struct Converter {
    layout: PixelLayout,
    scaler: VideoFrameScaler,
}

pub struct FfmpegEncoder {
    encoder: VideoEncoder,
    converter: Option<Converter>,
    pool: FramePool,
    source_size: (u32, u32),
    target_size: (usize, usize),
    time_base: TimeBase,
    ff_time_base: time::TimeBase,
    flushed: bool,
}

impl FfmpegEncoder {
    pub fn open(params: EncoderParams) -> Result<Self, EncodeError> {
        let target_size = (
            even(params.width as usize),
            even(params.height as usize),
        );
        let time_base = params.time_base();
        let ff_time_base = time::TimeBase::new(time_base.num, time_base.den);

        let (encoder, codec_name) = Self::try_create_encoder(&params, target_size, ff_time_base)?;
        log::info!(
            "Encoder: using {} ({}x{} @ {} fps, timebase {})",
            codec_name,
            target_size.0,
            target_size.1,
            params.fps,
            time_base
        );

        Ok(Self {
            encoder,
            converter: None,
            pool: FramePool::new(params.width as usize, params.height as usize, ff_time_base),
            source_size: (params.width, params.height),
            target_size,
            time_base,
            ff_time_base,
            flushed: false,
        })
    }

    fn try_create_encoder(
        params: &EncoderParams,
        (w, h): (usize, usize),
        time_base: time::TimeBase,
    ) -> Result<(VideoEncoder, &'static str), EncodeError> {
        let pixel_format = video::frame::get_pixel_format(TARGET_PIXEL_FORMAT);
        for codec in ENCODER_CHAIN {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("Encoder: {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            builder = builder
                .pixel_format(pixel_format)
                .width(w)
                .height(h)
                .time_base(time_base);
            for (k, v) in encoder_options(codec, params) {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(enc) => return Ok((enc, codec)),
                Err(e) => {
                    log::debug!("Encoder: {} failed to initialize: {}", codec, e);
                    continue;
                }
            }
        }
        Err(EncodeError::Unavailable(ENCODER_CHAIN.join(", ")))
    }

    fn converter_for(&mut self, layout: PixelLayout) -> Result<&mut Converter, EncodeError> {
        let stale = self
            .converter
            .as_ref()
            .is_none_or(|converter| converter.layout != layout);
        if stale {
            let (w, h) = (self.source_size.0 as usize, self.source_size.1 as usize);
            let source_format = video::frame::get_pixel_format(layout.ffmpeg_name());
            let scaler = VideoFrameScaler::builder()
                .source_pixel_format(source_format)
                .source_width(w)
                .source_height(h)
                .target_pixel_format(video::frame::get_pixel_format(TARGET_PIXEL_FORMAT))
                .target_width(self.target_size.0)
                .target_height(self.target_size.1)
                .algorithm(Algorithm::Bilinear)
                .build()?;
            log::debug!(
                "Encoder: converting {} {}x{} to {}",
                layout.ffmpeg_name(),
                w,
                h,
                TARGET_PIXEL_FORMAT
            );
            self.converter = Some(Converter { layout, scaler });
        }
        self.converter
            .as_mut()
            .ok_or_else(|| EncodeError::Unavailable(TARGET_PIXEL_FORMAT.to_string()))
    }
}

impl FrameEncoder for FfmpegEncoder {
    type Input = VideoFrame;

    fn time_base(&self) -> TimeBase {
        self.time_base
    }

    fn convert(&mut self, frame: &CapturedFrame) -> Result<VideoFrame, EncodeError> {
        if (frame.width, frame.height) != self.source_size {
            return Err(EncodeError::Geometry {
                got: (frame.width, frame.height),
                expected: self.source_size,
            });
        }
        let needed = frame.layout.buffer_len(frame.stride, frame.height as usize);
        if frame.data.len() < needed {
            return Err(EncodeError::ShortFrame {
                got: frame.data.len(),
                needed,
            });
        }

        let mut source = self.pool.take(frame.layout);
        write_planes(&mut source, frame);
        let source = source.freeze();
        let scaled = self.converter_for(frame.layout)?.scaler.scale(&source)?;
        self.pool.recycle(frame.layout, source);
        Ok(scaled)
    }

    fn submit(&mut self, frame: VideoFrame, pts: i64) -> Result<(), EncodeError> {
        if self.flushed {
            return Err(EncodeError::Flushed);
        }
        let frame = frame
            .with_time_base(self.ff_time_base)
            .with_pts(Timestamp::new(pts, self.ff_time_base));
        self.encoder.push(frame)?;
        Ok(())
    }

    fn poll(&mut self) -> Result<EncoderOutput, EncodeError> {
        match self.encoder.take()? {
            Some(packet) => {
                let pts = packet.pts().with_time_base(self.ff_time_base);
                let dts = packet.dts().with_time_base(self.ff_time_base);
                let pts = pts.timestamp();
                let dts = if dts.is_null() { pts } else { dts.timestamp() };
                Ok(EncoderOutput::Packet(MediaPacket {
                    data: Bytes::copy_from_slice(packet.data()),
                    pts,
                    dts,
                    time_base: self.time_base,
                    stream_index: 0,
                    is_keyframe: packet.is_key(),
                }))
            }
            None if self.flushed => Ok(EncoderOutput::EndOfStream),
            None => Ok(EncoderOutput::WouldBlock),
        }
    }

    fn flush(&mut self) -> Result<(), EncodeError> {
        if !self.flushed {
            self.encoder.flush()?;
            self.flushed = true;
        }
        Ok(())
    }
}

#[inline]
fn even(n: usize) -> usize {
    if n.is_multiple_of(2) { n } else { n + 1 }
}

fn write_planes(target: &mut VideoFrameMut, frame: &CapturedFrame) {
    let width = frame.width as usize;
    let height = frame.height as usize;
    match frame.layout {
        PixelLayout::Yuyv422 => {
            let mut planes = target.planes_mut();
            let plane = planes[0].data_mut();
            let line_size = plane.len() / height.max(1);
            copy_plane(&frame.data, frame.stride, plane, line_size, width * 2, height);
        }
        PixelLayout::Nv12 => {
            let luma_len = frame.stride * height;
            {
                let mut planes = target.planes_mut();
                let plane = planes[0].data_mut();
                let line_size = plane.len() / height.max(1);
                copy_plane(&frame.data[..luma_len], frame.stride, plane, line_size, width, height);
            }
            {
                let mut planes = target.planes_mut();
                let plane = planes[1].data_mut();
                let rows = height.div_ceil(2);
                let line_size = plane.len() / rows.max(1);
                copy_plane(
                    &frame.data[luma_len..],
                    frame.stride,
                    plane,
                    line_size,
                    even(width),
                    rows,
                );
            }
        }
    }
}

/// Copies `rows` rows of `row_bytes` between buffers with different strides.
///
/// Matching strides take a single memcpy. Rows that would run past either
/// buffer are left untouched.
fn copy_plane(
    source: &[u8],
    source_stride: usize,
    destination: &mut [u8],
    destination_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    let copy_width = row_bytes.min(source_stride).min(destination_stride);
    let total = rows * source_stride;

    if source_stride == destination_stride && source.len() >= total && destination.len() >= total
    {
        destination[..total].copy_from_slice(&source[..total]);
        return;
    }

    for r in 0..rows {
        let src_start = r * source_stride;
        let dst_start = r * destination_stride;
        if src_start + copy_width > source.len() || dst_start + copy_width > destination.len() {
            break;
        }
        destination[dst_start..dst_start + copy_width]
            .copy_from_slice(&source[src_start..src_start + copy_width]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_plane_same_stride() {
        let source: Vec<u8> = (0..12).collect();
        let mut destination = vec![0u8; 12];
        copy_plane(&source, 4, &mut destination, 4, 4, 3);
        assert_eq!(destination, source);
    }

    #[test]
    fn test_copy_plane_strips_padding() {
        // 2 rows of 3 bytes, source padded to 5 and destination to 4
        let source = [1, 2, 3, 0xEE, 0xEE, 4, 5, 6, 0xEE, 0xEE];
        let mut destination = vec![0u8; 8];
        copy_plane(&source, 5, &mut destination, 4, 3, 2);
        assert_eq!(destination, [1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn test_copy_plane_short_source() {
        let source = [9u8; 6];
        let mut destination = vec![0u8; 12];
        copy_plane(&source, 4, &mut destination, 4, 4, 3);
        assert_eq!(&destination[..4], &[9, 9, 9, 9]);
        assert_eq!(&destination[4..], &[0; 8]);
    }

    #[test]
    fn test_encoder_options() {
        let params = EncoderParams {
            width: 1280,
            height: 720,
            fps: 15,
        };
        let x264 = encoder_options("libx264", &params);
        assert!(x264.contains(&("g", "30".to_string())));
        assert!(x264.contains(&("bf", "0".to_string())));
        assert!(x264.contains(&("tune", "zerolatency".to_string())));

        let m2m = encoder_options("h264_v4l2m2m", &params);
        assert!(!m2m.iter().any(|(k, _)| *k == "preset"));
    }

    #[test]
    fn test_even_dimensions() {
        assert_eq!(even(640), 640);
        assert_eq!(even(641), 642);
    }
}
