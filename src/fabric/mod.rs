// Cross-domain communication fabric: wait-free SPSC queues, the atomic
// state cells shared between the audio and control domains, and the event
// payload types.

pub mod event;
pub mod ring;
pub mod state;
