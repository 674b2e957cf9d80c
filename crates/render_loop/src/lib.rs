use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cache::CacheEvent;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use render::{
    CancelToken, RenderMode, RenderOutcome, RenderSource, RenderTarget, ViewerTransform,
    render_into,
};


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderLoopConfig {
    /// How many coarse-to-fine passes a fresh viewport goes through.
    pub refinement_steps: u32,
    /// Pause between refinement passes while the viewport stays put.
    pub settle_delay: Duration,
}

impl Default for RenderLoopConfig {
    fn default() -> Self {
        Self {
            refinement_steps: 3,
            settle_delay: Duration::from_millis(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportRequest {
    pub width: u32,
    pub height: u32,
    pub transform: ViewerTransform,
}

impl ViewportRequest {
    pub fn screen_ratio(&self) -> f64 {
        self.transform.screen_ratio()
    }
}

/// Published after every completed or cancelled pass. Superseded partial
/// targets are published for observability but never used as backing.
#[derive(Debug, Clone)]
pub struct RenderProgress {
    pub serial: u64,
    pub step: u32,
    pub outcome: RenderOutcome,
    pub target: RenderTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderLoopStartError {
    NoSources,
    ZeroRefinementSteps,
}

#[derive(Debug, Clone, Copy)]
enum ControlMsg {
    Viewport(ViewportRequest),
    Shutdown,
}

type CancelSlot = Arc<Mutex<Option<CancelToken>>>;

fn cancel_current(slot: &CancelSlot) {
    if let Some(token) = slot.lock().expect("cancel slot lock poisoned").as_ref() {
        token.cancel();
    }
}

/// Entry point for viewport changes from the interaction thread. Cancelling
/// the in-flight pass and queueing the new request is one call so the loop
/// observes them in order. The sent-request counter is bumped before the
/// cancel: a cancel that lands on an already-finished pass still stops the
/// loop from starting another one ahead of the queued request.
#[derive(Clone)]
pub struct RenderLoopHandle {
    control: Sender<ControlMsg>,
    current_cancel: CancelSlot,
    requests_sent: Arc<AtomicU64>,
}

impl RenderLoopHandle {
    pub fn viewport_changed(&self, request: ViewportRequest) {
        self.requests_sent.fetch_add(1, Ordering::Release);
        cancel_current(&self.current_cancel);
        let _ = self.control.send(ControlMsg::Viewport(request));
    }
}

/// Owns the render thread. Applies the coarse-to-fine policy, discards
/// superseded output, and re-renders when loaded cells arrive while the
/// viewport is stationary. Shuts down on drop; background cache loads
/// already issued are left to complete on their own.
pub struct RenderLoopRuntime {
    control: Sender<ControlMsg>,
    current_cancel: CancelSlot,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl RenderLoopRuntime {
    pub fn start(
        config: RenderLoopConfig,
        sources: Vec<Arc<dyn RenderSource>>,
        cache_events: Receiver<CacheEvent>,
    ) -> Result<(Self, RenderLoopHandle, Receiver<RenderProgress>), RenderLoopStartError> {
        if sources.is_empty() {
            return Err(RenderLoopStartError::NoSources);
        }
        if config.refinement_steps == 0 {
            return Err(RenderLoopStartError::ZeroRefinementSteps);
        }

        let (control_sender, control_receiver) = unbounded();
        let (progress_sender, progress_receiver) = unbounded();
        let current_cancel: CancelSlot = Arc::new(Mutex::new(None));
        let requests_sent = Arc::new(AtomicU64::new(0));

        let thread_cancel = Arc::clone(&current_cancel);
        let thread_requests = Arc::clone(&requests_sent);
        let join_handle = std::thread::Builder::new()
            .name("render-loop".to_owned())
            .spawn(move || {
                render_loop_thread(
                    config,
                    sources,
                    cache_events,
                    control_receiver,
                    progress_sender,
                    thread_cancel,
                    thread_requests,
                )
            })
            .expect("spawn render loop thread");

        let handle = RenderLoopHandle {
            control: control_sender.clone(),
            current_cancel: Arc::clone(&current_cancel),
            requests_sent,
        };
        Ok((
            Self {
                control: control_sender,
                current_cancel,
                join_handle: Some(join_handle),
            },
            handle,
            progress_receiver,
        ))
    }

    pub fn shutdown(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        cancel_current(&self.current_cancel);
        let _ = self.control.send(ControlMsg::Shutdown);
        join_handle.join().expect("join render loop thread");
    }
}

impl Drop for RenderLoopRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Wakeup {
    Request(ViewportRequest),
    Repaint,
    Shutdown,
    EventsClosed,
    Nothing,
}

fn render_loop_thread(
    config: RenderLoopConfig,
    sources: Vec<Arc<dyn RenderSource>>,
    cache_events: Receiver<CacheEvent>,
    control: Receiver<ControlMsg>,
    progress: Sender<RenderProgress>,
    current_cancel: CancelSlot,
    requests_sent: Arc<AtomicU64>,
) {
    let mut cache_events = cache_events;
    let mut requests_seen: u64 = 0;
    let mut serial: u64 = 0;
    let mut current_request: Option<ViewportRequest> = None;
    let mut last_complete: Option<RenderTarget> = None;
    let mut pending: Option<(ViewportRequest, bool)> = None;

    'outer: loop {
        let (mut request, mut is_repaint) = match pending.take() {
            Some(next) => next,
            None => {
                log::trace!("render loop idle");
                let wakeup = select! {
                    recv(control) -> message => match message {
                        Ok(ControlMsg::Viewport(request)) => Wakeup::Request(request),
                        Ok(ControlMsg::Shutdown) | Err(_) => Wakeup::Shutdown,
                    },
                    recv(cache_events) -> event => match event {
                        Ok(CacheEvent::CellLoaded(_)) => Wakeup::Repaint,
                        Ok(CacheEvent::LoadFailed(_)) => Wakeup::Nothing,
                        Err(_) => Wakeup::EventsClosed,
                    },
                };
                match wakeup {
                    Wakeup::Request(request) => {
                        requests_seen += 1;
                        (request, false)
                    }
                    Wakeup::Repaint => match current_request {
                        Some(request) => (request, true),
                        None => continue 'outer,
                    },
                    Wakeup::Shutdown => return,
                    Wakeup::EventsClosed => {
                        cache_events = crossbeam_channel::never();
                        continue 'outer;
                    }
                    Wakeup::Nothing => continue 'outer,
                }
            }
        };

        // coalesce to the newest viewport before starting to render
        loop {
            match control.try_recv() {
                Ok(ControlMsg::Viewport(newer)) => {
                    requests_seen += 1;
                    request = newer;
                    is_repaint = false;
                }
                Ok(ControlMsg::Shutdown) => return,
                Err(_) => break,
            }
        }
        // stale load notifications are subsumed by the passes below
        while cache_events.try_recv().is_ok() {}

        current_request = Some(request);
        serial += 1;
        let ratio = request.screen_ratio();
        let steps = if is_repaint { 1 } else { config.refinement_steps };
        log::debug!("render serial {serial}: {steps} pass(es), screen ratio {ratio:.3}");

        let mut rendered_levels: Option<Vec<usize>> = None;
        for step in (0..steps).rev() {
            let coarsened = ratio * f64::powi(2.0, step as i32);
            let levels: Vec<usize> = sources
                .iter()
                .map(|source| source.best_level(coarsened))
                .collect();
            if rendered_levels.as_ref() == Some(&levels) {
                continue;
            }

            let token = CancelToken::new();
            *current_cancel.lock().expect("cancel slot lock poisoned") = Some(token.clone());

            // installing the token serializes with viewport_changed: a change
            // that missed this token has already bumped the sent counter, so
            // its request is in the channel or on its way
            if requests_sent.load(Ordering::Acquire) > requests_seen {
                match control.recv() {
                    Ok(ControlMsg::Viewport(next)) => {
                        requests_seen += 1;
                        pending = Some((next, false));
                    }
                    Ok(ControlMsg::Shutdown) | Err(_) => return,
                }
                break;
            }

            let mut target = RenderTarget::new(request.width, request.height, request.transform);
            if let Some(previous) = &last_complete {
                if previous.width() == target.width()
                    && previous.height() == target.height()
                    && previous.transform() == target.transform()
                {
                    target.adopt_backing(previous);
                }
            }

            let source_refs: Vec<&dyn RenderSource> =
                sources.iter().map(|source| source.as_ref()).collect();
            let outcome = match render_into(
                &mut target,
                &source_refs,
                &levels,
                RenderMode::Interactive,
                &token,
            ) {
                Ok(outcome) => outcome,
                Err(error) => {
                    log::warn!("render pass failed: {error}");
                    break;
                }
            };

            match outcome {
                RenderOutcome::Complete => {
                    rendered_levels = Some(levels);
                    last_complete = Some(target.clone());
                    let _ = progress.send(RenderProgress {
                        serial,
                        step,
                        outcome,
                        target,
                    });
                }
                RenderOutcome::PartialCancelled => {
                    log::debug!("render serial {serial} cancelled at step {step}");
                    let _ = progress.send(RenderProgress {
                        serial,
                        step,
                        outcome,
                        target,
                    });
                    // wait for the superseding request; the cancelled pass
                    // has observably stopped writing at this point
                    match control.recv() {
                        Ok(ControlMsg::Viewport(next)) => {
                            requests_seen += 1;
                            pending = Some((next, false));
                        }
                        Ok(ControlMsg::Shutdown) | Err(_) => return,
                    }
                    break;
                }
            }

            if step > 0 && !config.settle_delay.is_zero() {
                match control.recv_timeout(config.settle_delay) {
                    Ok(ControlMsg::Viewport(next)) => {
                        requests_seen += 1;
                        pending = Some((next, false));
                        break;
                    }
                    Ok(ControlMsg::Shutdown) => return,
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        }

        if pending.is_none() {
            *current_cancel.lock().expect("cancel slot lock poisoned") = None;
        }
    }
}
