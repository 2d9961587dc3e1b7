//! Sandboxed execution engine for untrusted handler code.
//!
//! The original spec described source that parses down to a single callable
//! expression, evaluated in a host-limited interpreter (timeout, memory cap,
//! cancellation). No JS/V8-style engine exists anywhere in the reference
//! corpus; the closest real precedent is `querymt`'s `extism_impl::host`,
//! which runs untrusted plugin code as WASM modules under the same shape of
//! constraints (manifest timeout, cancellation via `AtomicBool` + a `watch`
//! channel, execution on a blocking task). This module re-grounds the
//! sandbox on that precedent: untrusted code is a WASM module exporting a
//! single `handle` function instead of a source string. See DESIGN.md for
//! the recorded rationale.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use extism::{Manifest, Plugin, Wasm};
use tokio::sync::{Mutex, watch};

use crate::error::ErrorCode;


/// Limits enforced by the host around every sandboxed call.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout: Duration,
    /// Plugin memory ceiling, expressed in 64 KiB Wasm pages.
    pub max_memory_pages: u32,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_memory_pages: 256, // 16 MiB
            max_output_bytes: 1_048_576,
        }
    }
}

/// A sandbox-specific fault, convertible into [`crate::error::FusionError`]
/// via `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum SandboxFault {
    #[error("sandboxed call exceeded {0:?}")]
    Timeout(Duration),
    #[error("sandbox runtime error: {0}")]
    Runtime(String),
    #[error("sandboxed call was cancelled")]
    Aborted,
    #[error("invalid module: {0}")]
    InvalidCode(String),
    #[error("sandbox output exceeded {limit} bytes")]
    OutputTooLarge { limit: usize },
    #[error("sandbox is unavailable; it was explicitly disposed")]
    Unavailable,
}

impl SandboxFault {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::SandboxTimeout,
            Self::Runtime(_) => ErrorCode::SandboxRuntime,
            Self::Aborted => ErrorCode::SandboxAborted,
            Self::InvalidCode(_) => ErrorCode::SandboxInvalidCode,
            Self::OutputTooLarge { .. } => ErrorCode::SandboxOutputTooLarge,
            Self::Unavailable => ErrorCode::SandboxUnavailable,
        }
    }
}

/// A handle used to cancel an in-flight sandboxed call. Dropping it without
/// calling [`CancelHandle::cancel`] is a no-op; the watch channel is torn
/// down when the call itself finishes.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }
}

struct CancelGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

enum EngineState {
    Ready(Plugin),
    /// A prior call faulted (timed out, aborted, trapped, or overran the
    /// output cap). The isolate is gone; the next call transparently rebuilds
    /// one from `wasm_bytes` before running.
    Faulted,
    /// [`SandboxEngine::dispose`] was called explicitly. Unlike `Faulted`,
    /// this is permanent — every subsequent call returns `UNAVAILABLE` and no
    /// call ever rebuilds the isolate again.
    Disposed,
}

/// Runs untrusted WASM modules with a timeout, a memory ceiling, an output
/// size cap, and cooperative cancellation. One `SandboxEngine` wraps one
/// loaded module; a fault tears down the isolate but the engine recovers on
/// its own, rebuilding a fresh one from the retained module bytes the next
/// time it's called. Only an explicit [`Self::dispose`] call is permanent.
pub struct SandboxEngine {
    state: Mutex<EngineState>,
    limits: SandboxLimits,
    wasm_bytes: Vec<u8>,
}

impl SandboxEngine {
    /// Loads a WASM module from raw bytes. Fails with `INVALID_CODE` if the
    /// module is malformed or does not export `handle`.
    pub fn load(wasm_bytes: Vec<u8>, limits: SandboxLimits) -> Result<Self, SandboxFault> {
        let plugin = Self::build_plugin(&wasm_bytes, &limits)?;
        if !plugin_exports_handle(&plugin) {
            return Err(SandboxFault::InvalidCode("module does not export `handle`".into()));
        }

        Ok(Self {
            state: Mutex::new(EngineState::Ready(plugin)),
            limits,
            wasm_bytes,
        })
    }

    fn build_plugin(wasm_bytes: &[u8], limits: &SandboxLimits) -> Result<Plugin, SandboxFault> {
        let wasm = Wasm::data(wasm_bytes.to_vec());
        let manifest = Manifest::new([wasm]).with_timeout(limits.timeout).with_memory_max(limits.max_memory_pages);
        Plugin::new(&manifest, [], false).map_err(|e| SandboxFault::InvalidCode(e.to_string()))
    }

    /// Runs `handle(input)` to completion, subject to the engine's timeout
    /// but with no external cancellation source.
    pub async fn call(&self, input: Vec<u8>) -> Result<Vec<u8>, SandboxFault> {
        let (_tx, rx) = watch::channel(false);
        self.call_with_cancel(input, Arc::new(AtomicBool::new(false)), rx).await
    }

    /// Returns a [`CancelHandle`] the caller may invoke concurrently with
    /// awaiting the returned future to abort the in-flight call.
    pub fn call_with_cancel_handle(&self, input: Vec<u8>) -> (CancelHandle, impl Future<Output = Result<Vec<u8>, SandboxFault>> + '_) {
        let flag = Arc::new(AtomicBool::new(false));
        let (tx, rx) = watch::channel(false);
        let handle = CancelHandle { flag: flag.clone(), tx };
        (handle, self.call_with_cancel(input, flag, rx))
    }

    async fn call_with_cancel(
        &self,
        input: Vec<u8>,
        flag: Arc<AtomicBool>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<u8>, SandboxFault> {
        let _guard = CancelGuard { flag: flag.clone() };
        if flag.load(Ordering::SeqCst) {
            return Err(SandboxFault::Aborted);
        }

        let mut guard = self.state.lock().await;
        // Taking the state out up front leaves it `Faulted` by default for
        // the rest of this call; the only paths that put it back are a
        // successful rebuild-from-fault and a clean call completion below.
        let plugin = match std::mem::replace(&mut *guard, EngineState::Faulted) {
            EngineState::Disposed => {
                *guard = EngineState::Disposed;
                return Err(SandboxFault::Unavailable);
            }
            EngineState::Faulted => match Self::build_plugin(&self.wasm_bytes, &self.limits) {
                Ok(fresh) => fresh,
                Err(e) => return Err(e),
            },
            EngineState::Ready(p) => p,
        };

        let call = call_plugin_handle(plugin, input, self.limits.max_output_bytes, self.limits.timeout);
        tokio::pin!(call);

        let (plugin_back, outcome) = tokio::select! {
            res = &mut call => res,
            // The call future (and the blocking task driving it) is dropped
            // here; its Plugin never comes back, so the engine stays
            // `Faulted` and the next call rebuilds a fresh isolate — exactly
            // the recovery behavior a timed-out or runaway guest needs too.
            _ = wait_for_cancel(&mut cancel_rx) => (None, Err(SandboxFault::Aborted)),
        };

        if let (Some(p), Ok(_)) = (plugin_back, &outcome) {
            *guard = EngineState::Ready(p);
        }
        outcome
    }

    /// Permanently disables the engine. Idempotent: a blocking lock is
    /// acceptable here since dispose is a rare, administrative operation, not
    /// on the hot call path.
    pub fn dispose(&self) {
        if let Ok(mut guard) = self.state.try_lock() {
            *guard = EngineState::Disposed;
        }
    }
}

async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Invokes the guest `handle` export on a blocking task, matching
/// `querymt`'s `call_blocking_with_cancel`: `Plugin::call` blocks the thread
/// it runs on until the guest returns, so it must not run inline on the
/// async task driving the `select!` in the caller, or the cancel branch
/// could never be polled while a busy guest is running. The manifest's own
/// timeout is additionally enforced inside the Wasm engine itself (epoch
/// interruption aborts a runaway guest), surfacing here as a plugin error
/// classified as `Timeout`.
///
/// Returns the `Plugin` back alongside the outcome so the caller can put it
/// back into `Ready` state on success; `None` means the blocking task itself
/// panicked and the plugin is gone with it.
async fn call_plugin_handle(
    mut plugin: Plugin,
    input: Vec<u8>,
    max_output_bytes: usize,
    timeout: Duration,
) -> (Option<Plugin>, Result<Vec<u8>, SandboxFault>) {
    let joined = tokio::task::spawn_blocking(move || {
        let result = plugin.call::<&[u8], &[u8]>("handle", &input).map(|o| o.to_vec());
        (plugin, result)
    })
    .await;

    match joined {
        Ok((plugin, Ok(output))) if output.len() > max_output_bytes => {
            (Some(plugin), Err(SandboxFault::OutputTooLarge { limit: max_output_bytes }))
        }
        Ok((plugin, Ok(output))) => (Some(plugin), Ok(output)),
        Ok((plugin, Err(e))) => {
            let message = e.to_string();
            let fault = if message.to_lowercase().contains("timeout") || message.to_lowercase().contains("epoch") {
                SandboxFault::Timeout(timeout)
            } else {
                SandboxFault::Runtime(message)
            };
            (Some(plugin), Err(fault))
        }
        Err(join_err) => (None, Err(SandboxFault::Runtime(format!("blocking task failed: {join_err}")))),
    }
}

fn plugin_exports_handle(plugin: &Plugin) -> bool {
    plugin.function_exists("handle")
}
