//! Renders a procedural image through the full pipeline and writes the
//! settled frame to `progressive.png`. Run with `RUST_LOG=debug` to watch
//! the coarse-to-fine passes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cache::{ArraySource, CacheConfig, LoadRequest, SourceError};
use model::{ChannelId, TimepointId};
use pyramid::{LevelSpec, MultiResolutionSource};
use render::{PyramidSource, RenderOutcome, RenderSource, ViewerTransform, argb};
use render_loop::{RenderLoopConfig, RenderLoopRuntime, ViewportRequest};

const FULL_DIMS: [u64; 3] = [2048, 2048, 1];
const LEVELS: [u32; 4] = [1, 2, 4, 8];

/// Procedural rings, sampled at full resolution and box-averaged per level.
struct RingSource {
    downsampling: Vec<[u32; 3]>,
}

fn ring_value(x: u64, y: u64) -> u16 {
    let dx = x as f64 - FULL_DIMS[0] as f64 / 2.0;
    let dy = y as f64 - FULL_DIMS[1] as f64 / 2.0;
    let radius = (dx * dx + dy * dy).sqrt();
    (((radius / 48.0).sin() * 0.5 + 0.5) * u16::MAX as f64) as u16
}

impl ArraySource<u16> for RingSource {
    fn load(&self, request: &LoadRequest) -> Result<Box<[u16]>, SourceError> {
        let factor = self.downsampling[request.key.level().0 as usize];
        let [width, height, depth] = request.shape;
        let mut data = Vec::with_capacity(width as usize * height as usize * depth as usize);
        for _z in 0..depth {
            for y in 0..height {
                for x in 0..width {
                    let gx = (request.origin[0] + x as u64) * factor[0] as u64;
                    let gy = (request.origin[1] + y as u64) * factor[1] as u64;
                    data.push(ring_value(gx, gy));
                }
            }
        }
        // a little latency makes the progressive refinement visible
        std::thread::sleep(Duration::from_millis(1));
        Ok(data.into_boxed_slice())
    }
}

fn main() {
    env_logger::init();

    let level_specs: Vec<LevelSpec> = LEVELS.iter().map(|&f| LevelSpec::isotropic(f)).collect();
    let downsampling = level_specs.iter().map(|spec| spec.downsampling).collect();
    let pyramid = Arc::new(
        MultiResolutionSource::new(
            ChannelId(0),
            TimepointId(0),
            FULL_DIMS,
            [64, 64, 1],
            &level_specs,
            CacheConfig::default(),
            1.0,
            Arc::new(RingSource { downsampling }),
        )
        .expect("start pyramid"),
    );

    let events = pyramid.events();
    let convert = |value: u16| {
        let v = (value >> 8) as u8;
        argb(255, v, v, v)
    };
    let source: Arc<dyn RenderSource> = Arc::new(PyramidSource::new(pyramid, convert));

    let (mut runtime, handle, progress) =
        RenderLoopRuntime::start(RenderLoopConfig::default(), vec![source], events)
            .expect("start render loop");

    let width = 512u32;
    let height = 512u32;
    handle.viewport_changed(ViewportRequest {
        width,
        height,
        transform: ViewerTransform {
            offset: [512.0, 512.0],
            scale: 0.5,
            slice: 0,
        },
    });

    let started = Instant::now();
    let deadline = started + Duration::from_secs(60);
    let settled = loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("frame settles within a minute");
        let update = progress
            .recv_timeout(remaining)
            .expect("render progress arrives");
        log::info!(
            "serial {} step {} {:?}: {}/{} cells after {:?}",
            update.serial,
            update.step,
            update.outcome,
            update.target.coverage().covered(),
            update.target.coverage().len(),
            started.elapsed()
        );
        if update.outcome == RenderOutcome::Complete && update.target.coverage().is_complete() {
            break update;
        }
    };
    runtime.shutdown();

    let mut out = image::RgbaImage::new(width, height);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let value = settled.target.pixel(x, y);
        *pixel = image::Rgba([
            ((value >> 16) & 0xff) as u8,
            ((value >> 8) & 0xff) as u8,
            (value & 0xff) as u8,
            ((value >> 24) & 0xff) as u8,
        ]);
    }
    out.save("progressive.png").expect("write png");
    println!("wrote progressive.png in {:?}", started.elapsed());
}
