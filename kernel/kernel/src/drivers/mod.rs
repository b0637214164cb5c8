//! Device drivers: interrupt controllers, serial, input, NIC, and the
//! virtio block device.

pub mod e1000;
pub mod i8042;
pub mod lapic;
pub mod pic;
pub mod serial;
pub mod virtio_blk;
