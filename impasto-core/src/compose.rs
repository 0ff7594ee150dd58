//! Pixel blending used by projection updates and merges.
//!
//! Four byte pixels are treated as straight-alpha RGBA8. Other pixel sizes have no alpha, and a
//! source pixel that is not all zero simply replaces the destination.

/// Source-over with an extra `opacity` factor.
pub(crate) fn over(dst: &mut [u8], src: &[u8], opacity: u8) {
    debug_assert_eq!(dst.len(), src.len());
    if src.len() != 4 {
        if src.iter().any(|&byte| byte != 0) {
            dst.copy_from_slice(src);
        }
        return;
    }
    let src_alpha = u32::from(src[3]) * u32::from(opacity) / 255;
    if src_alpha == 0 {
        return;
    }
    let dst_alpha = u32::from(dst[3]) * (255 - src_alpha) / 255;
    let out_alpha = src_alpha + dst_alpha;
    for channel in 0..3 {
        let mixed = u32::from(src[channel]) * src_alpha + u32::from(dst[channel]) * dst_alpha;
        dst[channel] = (mixed / out_alpha) as u8;
    }
    dst[3] = out_alpha as u8;
}
