use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Tag;

/// Tag name shared by all lifecycle commands.
pub const PROCESS_TAG: &str = "process";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
  Created,
  Allocated,
  Started,
  Stopped,
  Removed,
}

impl fmt::Display for State {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      State::Created => "created",
      State::Allocated => "allocated",
      State::Started => "started",
      State::Stopped => "stopped",
      State::Removed => "removed",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
  Allocate,
  Start,
  Stop,
  Delete,
}

impl Transition {
  pub fn verb(self) -> &'static str {
    match self {
      Transition::Allocate => "allocate",
      Transition::Start => "start",
      Transition::Stop => "stop",
      Transition::Delete => "delete",
    }
  }

  pub fn tag(self) -> Tag {
    Tag::new(PROCESS_TAG, self.verb())
  }

  pub fn from_tag(tag: &Tag) -> Option<Self> {
    if tag.name != PROCESS_TAG {
      return None;
    }
    match tag.value.as_str() {
      "allocate" => Some(Transition::Allocate),
      "start" => Some(Transition::Start),
      "stop" => Some(Transition::Stop),
      "delete" => Some(Transition::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for Transition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.verb())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transition not allowed: cannot {transition} from {from}")]
pub struct TransitionError {
  pub transition: Transition,
  pub from: State,
}

impl State {
  /// The state reached by applying `transition`, if legal.
  pub fn next(self, transition: Transition) -> Result<State, TransitionError> {
    use State::*;
    use Transition::*;

    match (self, transition) {
      (Created, Allocate) => Ok(Allocated),
      (Allocated | Stopped, Start) => Ok(Started),
      (Started, Stop) => Ok(Stopped),
      (Created | Allocated | Stopped, Delete) => Ok(Removed),
      (from, transition) => Err(TransitionError { transition, from }),
    }
  }
}

/// Lifecycle of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
  current: State,
}

impl Default for ResourceState {
  fn default() -> Self {
    Self {
      current: State::Created,
    }
  }
}

impl ResourceState {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn current(&self) -> State {
    self.current
  }

  /// Check a transition without applying it.
  pub fn peek(&self, transition: Transition) -> Result<State, TransitionError> {
    self.current.next(transition)
  }

  /// Apply a transition. Illegal transitions leave the state unchanged.
  pub fn send(&mut self, transition: Transition) -> Result<State, TransitionError> {
    self.current = self.current.next(transition)?;
    Ok(self.current)
  }
}
