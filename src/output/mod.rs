//! Output fan-out (C7): the three independent sinks a pipeline tick feeds
//! after the rule engine runs — alarm delivery, clip recording, and the
//! live overlay/MJPEG stream.

pub mod alarm;
pub mod mp4_mux;
pub mod recorder;
pub mod streamer;
