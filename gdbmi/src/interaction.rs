use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

lazy_static! {
    static ref MENU_ITEM: Regex = Regex::new(r"^\[(\d+)\] (.+)$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct MenuItem {
    number: u32,
    label: String,
}

/// A numbered-choice menu found in console output, such as the one gdb
/// prints when a location matches several overloads:
///
/// ```text
/// [0] cancel
/// [1] all
/// [2] A::f(int) at a.cc:3
/// [3] A::f(char) at a.cc:7
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InteractionMenu {
    items: Vec<MenuItem>,
    cancel: Option<u32>,
    all: Option<u32>,
}

impl InteractionMenu {
    pub fn parse(text: &str) -> Self {
        let mut menu = Self::default();
        for line in text.lines() {
            let Some(caps) = MENU_ITEM.captures(line) else {
                continue;
            };
            let Ok(number) = caps[1].parse::<u32>() else {
                continue;
            };
            match &caps[2] {
                "cancel" => menu.cancel = Some(number),
                "all" => menu.all = Some(number),
                label => menu.items.push(MenuItem {
                    number,
                    label: label.to_owned(),
                }),
            }
        }
        menu
    }

    /// Labels of the real choices, in the order gdb listed them.
    pub fn items(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.label.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn first_choice(&self) -> Option<u32> {
        self.items.first().map(|item| item.number)
    }

    pub fn has_cancel(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn cancel_choice(&self) -> Option<u32> {
        self.cancel
    }

    pub fn has_all(&self) -> bool {
        self.all.is_some()
    }

    pub fn all_choice(&self) -> Option<u32> {
        self.all
    }

    /// The reply line for a pick of item positions (0-based into
    /// [`items`](Self::items)). Nothing picked answers with the cancel
    /// choice. Returns `None` if a position is out of range, or nothing was
    /// picked and the menu cannot be cancelled.
    pub fn answer(&self, picked: &[usize]) -> Option<String> {
        if picked.is_empty() {
            return self.cancel.map(|n| n.to_string());
        }
        if picked.len() == self.items.len() {
            if let Some(all) = self.all {
                return Some(all.to_string());
            }
        }
        let numbers = picked
            .iter()
            .map(|&idx| self.items.get(idx).map(|item| item.number.to_string()))
            .collect::<Option<Vec<_>>>()?;
        Some(numbers.join(" "))
    }
}
