/// Devices are the atomic units that wrap a vendor driver; their core
/// responsibilities do not change based on where in the rig they sit.
pub mod hardware {
    /// Device Adapter (spec §4.A): a thin facade over the vendor camera SDK.
    pub mod camera;
}
