//! Core domain models for chatroom coordination.
//!
//! This module contains the records the coordination protocol reads and
//! writes: chatrooms, participants and tasks.

pub mod chatroom;
pub mod participant;
pub mod task;

pub use chatroom::{Chatroom, ChatroomId, ChatroomStatus, TeamSpec};
pub use participant::{AgentStatus, LegacyStatus, Participant, StatusTransition};
pub use task::{Classification, HandoffRecord, Task, TaskId, TaskStatus};
