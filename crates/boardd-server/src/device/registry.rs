//! All configured boards, selectable by identifier.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::Config;
use crate::device::Board;

pub struct Registry {
    boards: Vec<Rc<RefCell<Board>>>,
}

impl Registry {
    pub fn from_config(config: Config) -> Self {
        Self {
            boards: config
                .boards
                .into_iter()
                .map(|board| Rc::new(RefCell::new(Board::new(board))))
                .collect(),
        }
    }

    pub fn find(&self, name: &str) -> Option<Rc<RefCell<Board>>> {
        self.boards
            .iter()
            .find(|board| board.borrow().name() == name)
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<RefCell<Board>>> {
        self.boards.iter()
    }
}
