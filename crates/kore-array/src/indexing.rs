//! Cross-backend indexed read and write.
//!
//! Neither operation is differentiable: results never carry autograd
//! history. They bridge backends until every backend indexes natively.
//!
//! # Duplicate positions on write
//!
//! When a key names the same position more than once, `setitem` on a CPU
//! destination (or an accelerator array held in host memory) keeps the
//! value from the last occurrence in index order. On a GPU destination the
//! writes are issued in parallel and the value that ends up stored is
//! unspecified: any one of the candidates.

use kore_core::{DeviceGuard, KoreError, Result};

use crate::backend::{
    fallback_key, Array, ArrayBackend, ArrayKind, FallbackReason, IndexItem, IndexOutcome,
};
use crate::config::{self, ArrayConfig};

/// Read `x[key]`, falling back to a tensor when `x`'s backend declines
/// the key. Uses the process-wide [`ArrayConfig`].
///
/// The result is in the same kind family as `x`: an accelerator input
/// gives an accelerator result.
pub fn getitem(x: &Array, key: &[IndexItem]) -> Result<Array> {
    getitem_with(x, key, &config::global())
}

/// [`getitem`] with an explicit configuration.
pub fn getitem_with(x: &Array, key: &[IndexItem], config: &ArrayConfig) -> Result<Array> {
    let reason = match x.try_getitem(key)? {
        IndexOutcome::Done(out) => return Ok(out),
        IndexOutcome::Unsupported(reason) => reason,
    };
    begin_fallback(config, "getitem", x.kind(), reason)?;

    let data = x.to_fallback()?;
    let key = fallback_key(key)?;
    let out = {
        let _scope = DeviceGuard::new(data.device())?;
        data.index(&key)?
    };
    Ok(Array::from_fallback(out, x.kind()))
}

/// Write `value` into `x[key]` in place. Uses the process-wide
/// [`ArrayConfig`].
///
/// Accelerator arguments (destination, index arrays, value) are converted
/// to tensors first. The conversion shares storage, so the write lands in
/// the destination's buffer and is visible through every array viewing
/// it. See the module docs for duplicate-position semantics.
pub fn setitem(x: &mut Array, key: &[IndexItem], value: &Array) -> Result<()> {
    setitem_with(x, key, value, &config::global())
}

/// [`setitem`] with an explicit configuration.
///
/// Writes always go through the tensor path, so `allow_fallback` does
/// not apply here; `log_fallback` still reports accelerator conversions.
pub fn setitem_with(
    x: &mut Array,
    key: &[IndexItem],
    value: &Array,
    config: &ArrayConfig,
) -> Result<()> {
    let order = x.scatter_order();
    let key = fallback_key(key)?;
    let value = value.to_fallback()?;

    match x {
        Array::Cpu(t) | Array::Gpu(t) => {
            let _scope = DeviceGuard::new(t.device())?;
            t.index_put_with(&key, &value, order)
        }
        Array::Accel(a) => {
            if config.log_fallback {
                tracing::debug!(
                    target: "kore_array::fallback",
                    op = "setitem",
                    kind = %ArrayKind::Accel,
                    "writing through fallback tensor"
                );
            }
            // shares a's storage, so the write lands in a and its views
            let mut data = a.to_tensor()?;
            let _scope = DeviceGuard::new(data.device())?;
            data.index_put_with(&key, &value, order)
        }
    }
}

fn begin_fallback(
    config: &ArrayConfig,
    op: &str,
    kind: ArrayKind,
    reason: FallbackReason,
) -> Result<()> {
    if !config.allow_fallback {
        return Err(KoreError::FallbackDisabled(format!("{op} on {kind} array: {reason}")));
    }
    if config.log_fallback {
        tracing::debug!(
            target: "kore_array::fallback",
            op,
            %kind,
            %reason,
            "native indexing declined, using fallback tensor"
        );
    }
    Ok(())
}
