//! Reference environments implemented natively, no simulator bindings required.

pub mod cartpole;
pub mod countdown;
pub mod pendulum;

pub use cartpole::CartPole;
pub use countdown::CountDown;
pub use pendulum::Pendulum;
