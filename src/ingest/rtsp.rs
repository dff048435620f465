//! RTSP frame source.
//!
//! `rtsp://` URLs are decoded by a GStreamer pipeline (`rtsp-gstreamer`
//! feature). `stub://` URLs produce a moving test pattern at the configured
//! rate, for tests and for running the gateway without a camera.
//!
//! Each `RtspConnector::connect` opens a fresh source; a source that fails a
//! read is dropped by the reader and never reused.

use anyhow::Result;
use std::time::Duration;

use super::{FrameSource, SourceConnector};
use crate::frame::Frame;

const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug)]
pub struct RtspConfig {
    pub url: String,
    /// Expected frame rate. Bounds the decoder's read timeout and paces the
    /// test pattern.
    pub target_fps: u32,
    /// Test pattern size; decoded streams keep their native size.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://192.168.2.100:8554/test".to_string(),
            target_fps: 10,
            width: 1280,
            height: 720,
        }
    }
}

impl RtspConfig {
    fn frame_period(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_millis(1000 / u64::from(self.target_fps)))
    }
}

/// An open stream, ready to read.
pub enum RtspSource {
    TestPattern(TestPattern),
    #[cfg(feature = "rtsp-gstreamer")]
    Decoder(gst::Decoder),
}

impl RtspSource {
    pub fn open(config: &RtspConfig) -> Result<Self> {
        if config.url.starts_with(STUB_SCHEME) {
            log::info!("rtsp: serving test pattern for {}", config.url);
            return Ok(Self::TestPattern(TestPattern::new(config)));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            Ok(Self::Decoder(gst::Decoder::open(config)?))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            Err(anyhow::anyhow!(
                "cannot open {}: decoding RTSP needs the rtsp-gstreamer feature",
                config.url
            ))
        }
    }

    /// Frames handed out since the source was opened.
    pub fn frames_read(&self) -> u64 {
        match self {
            Self::TestPattern(pattern) => pattern.sequence,
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Decoder(decoder) => decoder.frames_read(),
        }
    }
}

impl FrameSource for RtspSource {
    fn read_frame(&mut self) -> Result<Frame> {
        match self {
            Self::TestPattern(pattern) => pattern.capture(),
            #[cfg(feature = "rtsp-gstreamer")]
            Self::Decoder(decoder) => decoder.capture(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RtspConnector {
    config: RtspConfig,
}

impl RtspConnector {
    pub fn new(config: RtspConfig) -> Self {
        Self { config }
    }
}

impl SourceConnector for RtspConnector {
    type Source = RtspSource;

    fn connect(&self) -> Result<RtspSource> {
        RtspSource::open(&self.config)
    }

    fn describe(&self) -> String {
        self.config.url.clone()
    }
}

/// A bright bar sweeping across a dark background.
pub struct TestPattern {
    width: u32,
    height: u32,
    period: Option<Duration>,
    sequence: u64,
}

impl TestPattern {
    fn new(config: &RtspConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            period: config.frame_period(),
            sequence: 0,
        }
    }

    fn capture(&mut self) -> Result<Frame> {
        if let Some(period) = self.period {
            std::thread::sleep(period);
        }
        self.sequence += 1;

        let bar_width = (self.width / 16).max(1);
        let bar_x = ((self.sequence * 8) % u64::from(self.width.max(1))) as u32;
        let image = image::RgbImage::from_fn(self.width, self.height, |x, y| {
            if x >= bar_x && x < bar_x + bar_width {
                image::Rgb([230, 230, 230])
            } else {
                let shade = (y * 64 / self.height.max(1)) as u8;
                image::Rgb([20 + shade, 30, 40 + shade])
            }
        });
        Ok(Frame::new(image, self.sequence))
    }
}

#[cfg(feature = "rtsp-gstreamer")]
pub mod gst {
    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;
    use std::time::Duration;

    use super::RtspConfig;
    use crate::frame::Frame;

    /// Minimum wait for one decoded sample.
    const MIN_READ_TIMEOUT: Duration = Duration::from_millis(500);
    /// Wait for the first sample, which includes RTSP negotiation.
    const FIRST_READ_TIMEOUT: Duration = Duration::from_secs(5);

    /// `rtspsrc ! decodebin ! videoconvert ! appsink` producing RGB, keeping
    /// only the newest sample.
    pub struct Decoder {
        url: String,
        pipeline: gstreamer::Pipeline,
        sink: gstreamer_app::AppSink,
        read_timeout: Duration,
        frames: u64,
    }

    impl Decoder {
        pub fn open(config: &RtspConfig) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;

            let description = format!(
                "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! \
                 video/x-raw,format=RGB ! appsink name=sink sync=false max-buffers=1 drop=true",
                config.url
            );
            let pipeline = gstreamer::parse::launch(&description)
                .with_context(|| format!("build pipeline for {}", config.url))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("parsed RTSP description is not a pipeline"))?;
            let sink = pipeline
                .by_name("sink")
                .context("pipeline has no appsink")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("sink element is not an appsink"))?;

            pipeline
                .set_state(gstreamer::State::Playing)
                .with_context(|| format!("start pipeline for {}", config.url))?;
            log::info!("rtsp: pipeline playing for {}", config.url);

            let read_timeout = config
                .frame_period()
                .map(|period| period * 4)
                .unwrap_or(MIN_READ_TIMEOUT)
                .max(MIN_READ_TIMEOUT);
            Ok(Self {
                url: config.url.clone(),
                pipeline,
                sink,
                read_timeout,
                frames: 0,
            })
        }

        pub fn frames_read(&self) -> u64 {
            self.frames
        }

        pub fn capture(&mut self) -> Result<Frame> {
            self.check_bus()?;

            let timeout = if self.frames == 0 {
                FIRST_READ_TIMEOUT.max(self.read_timeout)
            } else {
                self.read_timeout
            };
            let nanos = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
            let sample = self
                .sink
                .try_pull_sample(gstreamer::ClockTime::from_nseconds(nanos))
                .ok_or_else(|| anyhow!("no frame from {} within {:?}", self.url, timeout))?;

            self.frames += 1;
            to_frame(&sample, self.frames)
        }

        fn check_bus(&self) -> Result<()> {
            let Some(bus) = self.pipeline.bus() else {
                return Ok(());
            };
            while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
                match message.view() {
                    gstreamer::MessageView::Error(err) => {
                        return Err(anyhow!("pipeline error on {}: {}", self.url, err.error()));
                    }
                    gstreamer::MessageView::Eos(..) => {
                        return Err(anyhow!("stream {} ended", self.url));
                    }
                    _ => {}
                }
            }
            Ok(())
        }
    }

    impl Drop for Decoder {
        fn drop(&mut self) {
            if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("rtsp: cannot release pipeline for {}: {}", self.url, e);
            }
        }
    }

    /// Copy an RGB sample into a frame, dropping any row padding.
    fn to_frame(sample: &gstreamer::Sample, sequence: u64) -> Result<Frame> {
        let caps = sample.caps().context("sample has no caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps).context("sample caps are not video")?;
        let buffer = sample.buffer().context("sample has no buffer")?;
        let map = buffer.map_readable().context("map sample buffer")?;
        let data = map.as_slice();

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 3;
        let stride = usize::try_from(info.stride()[0]).context("negative stride")?;
        let mut pixels = Vec::with_capacity(row * height as usize);
        for chunk in data.chunks(stride.max(row)).take(height as usize) {
            pixels.extend_from_slice(chunk.get(..row).context("short row in sample")?);
        }
        Frame::from_rgb(width, height, pixels, sequence).context("sample smaller than its caps")
    }
}
