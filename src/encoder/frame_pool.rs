use crate::assets::CAPTURE_BUFFERS;
use crate::capture::PixelLayout;
use ac_ffmpeg::codec::video::{self, VideoFrame, VideoFrameMut};
use ac_ffmpeg::time::TimeBase;
use std::collections::VecDeque;

/// Source frames the captured planes are copied into before scaling, one
/// queue per capture layout.
///
/// The capture loop never has more frames in flight than the device has
/// buffers, so a queue keeps at most [`CAPTURE_BUFFERS`] frames. A frame is
/// written again only once the scaler holds no reference to it.
pub(crate) struct FramePool {
    width: usize,
    height: usize,
    time_base: TimeBase,
    queues: Vec<(PixelLayout, VecDeque<VideoFrame>)>,
}

impl FramePool {
    pub fn new(width: usize, height: usize, time_base: TimeBase) -> Self {
        Self {
            width,
            height,
            time_base,
            queues: Vec::with_capacity(2),
        }
    }

    fn queue(&mut self, layout: PixelLayout) -> &mut VecDeque<VideoFrame> {
        let at = match self.queues.iter().position(|(l, _)| *l == layout) {
            Some(at) => at,
            None => {
                self.queues
                    .push((layout, VecDeque::with_capacity(CAPTURE_BUFFERS as usize)));
                self.queues.len() - 1
            }
        };
        &mut self.queues[at].1
    }

    /// A writable frame in `layout`, allocated when none of the pooled ones is free.
    pub fn take(&mut self, layout: PixelLayout) -> VideoFrameMut {
        let queue = self.queue(layout);
        for _ in 0..queue.len() {
            let Some(frame) = queue.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                Err(frame) => queue.push_back(frame),
            }
        }

        log::debug!(
            "Encoder: allocating {} {}x{} source frame",
            layout.ffmpeg_name(),
            self.width,
            self.height
        );
        let format = video::frame::get_pixel_format(layout.ffmpeg_name());
        VideoFrameMut::black(format, self.width, self.height).with_time_base(self.time_base)
    }

    /// Hands a frame back for reuse. Frames beyond the capture depth are dropped.
    pub fn recycle(&mut self, layout: PixelLayout, frame: VideoFrame) {
        let queue = self.queue(layout);
        if queue.len() < CAPTURE_BUFFERS as usize {
            queue.push_back(frame);
        }
    }
}
