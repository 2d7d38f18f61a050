//! End-to-end scenarios for the lowering pipeline live under `tests/`.
