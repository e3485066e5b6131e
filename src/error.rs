
/// Frame codec errors.
///
/// The link layer surfaces failures through its status word rather
/// than structured errors, so this enum stays deliberately small: the
/// only structural decode failure is a buffer too short to hold the
/// fixed frame overhead. FCS mismatches are not errors; they decode
/// with `crc_ok = false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the fixed header + FCS overhead.
    Truncated(usize),
}
