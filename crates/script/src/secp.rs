use std::sync::OnceLock;

use secp256k1::{Secp256k1, VerifyOnly};

static VERIFY_CONTEXT: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();

/// Shared verification-only context; building one is comparatively costly.
pub(crate) fn verify_context() -> &'static Secp256k1<VerifyOnly> {
    VERIFY_CONTEXT.get_or_init(Secp256k1::verification_only)
}
