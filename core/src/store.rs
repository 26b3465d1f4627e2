//! Read-through cache of the user's todo list.
//!
//! The server owns the todos; this is the last list it returned. Every
//! mutation replaces the whole list with the server's answer.

use std::sync::{Mutex, PoisonError};

use crate::types::Todo;

#[derive(Debug, Default)]
pub struct TodoCache {
    todos: Mutex<Option<Vec<Todo>>>,
}

impl TodoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached list, or `None` if nothing has been loaded yet.
    pub fn get(&self) -> Option<Vec<Todo>> {
        self.todos
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, todos: Vec<Todo>) {
        *self.todos.lock().unwrap_or_else(PoisonError::into_inner) = Some(todos);
    }

    pub fn clear(&self) {
        *self.todos.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
