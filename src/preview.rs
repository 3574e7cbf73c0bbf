//! Local preview window
//!
//! Shows the live camera image, never the frozen one. Closing the window
//! or pressing `q` asks the node to shut down.

use crate::capture::{CapturedFrame, PixelLayout};
use crate::pipeline::PreviewSink;
use log::{info, warn};
use minifb::{Key, Window, WindowOptions};

pub struct WindowPreview {
    window: Window,
    rgb: Vec<u32>,
}

impl WindowPreview {
    pub fn open(title: &str, width: u32, height: u32) -> Result<Self, minifb::Error> {
        let mut window = Window::new(
            title,
            width as usize,
            height as usize,
            WindowOptions::default(),
        )?;
        window.set_target_fps(0);
        info!("Pipeline: preview window {}x{} open", width, height);
        Ok(Self {
            window,
            rgb: Vec::new(),
        })
    }
}

impl PreviewSink for WindowPreview {
    fn show(&mut self, frame: &CapturedFrame) -> bool {
        to_rgb(frame, &mut self.rgb);
        if let Err(e) = self.window.update_with_buffer(
            &self.rgb,
            frame.width as usize,
            frame.height as usize,
        ) {
            warn!("Pipeline: preview update failed: {}", e);
        }
        self.window.is_open() && !self.window.is_key_down(Key::Q)
    }
}

impl Drop for WindowPreview {
    fn drop(&mut self) {
        info!("Pipeline: preview window closed");
    }
}

/// BT.601 limited range to packed 0RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> u32 {
    let c = (y as i32 - 16) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u32;
    let r = clamp(c + 409 * e);
    let g = clamp(c - 100 * d - 208 * e);
    let b = clamp(c + 516 * d);
    (r << 16) | (g << 8) | b
}

fn to_rgb(frame: &CapturedFrame, out: &mut Vec<u32>) {
    let (w, h) = (frame.width as usize, frame.height as usize);
    out.clear();
    out.resize(w * h, 0);
    let data = &frame.data[..];

    match frame.layout {
        PixelLayout::Yuyv422 => {
            for row in 0..h {
                let line = &data[(row * frame.stride).min(data.len())..];
                for pair in 0..w / 2 {
                    let Some(px) = line.get(pair * 4..pair * 4 + 4) else {
                        break;
                    };
                    let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
                    out[row * w + pair * 2] = yuv_to_rgb(y0, u, v);
                    out[row * w + pair * 2 + 1] = yuv_to_rgb(y1, u, v);
                }
            }
        }
        PixelLayout::Nv12 => {
            let chroma = frame.stride * h;
            for row in 0..h {
                for col in 0..w {
                    let y = data.get(row * frame.stride + col).copied().unwrap_or(16);
                    let uv = chroma + (row / 2) * frame.stride + (col & !1);
                    let u = data.get(uv).copied().unwrap_or(128);
                    let v = data.get(uv + 1).copied().unwrap_or(128);
                    out[row * w + col] = yuv_to_rgb(y, u, v);
                }
            }
        }
    }
}
