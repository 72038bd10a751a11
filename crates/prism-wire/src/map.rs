//! The object/id registry shared by both endpoint roles.
//!
//! The 32-bit id space is split in two: ids below [`SERVER_ID_BASE`]
//! are allocated by the client, ids at or above it by the server.
//! Id 0 is the nil sentinel and never occupies a slot.

use crate::error::{Result, WireError};

/// First id of the server-allocated range.
pub const SERVER_ID_BASE: u32 = 0xff00_0000;

/// Which half of the id space an allocation draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// The side that owns a given id.
    pub fn of(id: u32) -> Side {
        if id >= SERVER_ID_BASE {
            Side::Server
        } else {
            Side::Client
        }
    }
}

/// An occupied slot.
#[derive(Debug)]
pub enum Entry<T> {
    Live(T),
    /// Locally destroyed, awaiting the peer's `delete_id`
    /// acknowledgement. Messages addressed here are absorbed.
    Zombie,
}

/// Result of a non-consuming lookup.
#[derive(Debug)]
pub enum Lookup<'a, T> {
    Vacant,
    Live(&'a T),
    Zombie,
}

/// Sparse map from object ids to records, one dense vector per side.
#[derive(Debug)]
pub struct ObjectMap<T> {
    client: Vec<Option<Entry<T>>>,
    server: Vec<Option<Entry<T>>>,
}

impl<T> Default for ObjectMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectMap<T> {
    pub fn new() -> Self {
        ObjectMap {
            client: Vec::new(),
            server: Vec::new(),
        }
    }

    fn index(id: u32) -> (Side, usize) {
        match Side::of(id) {
            Side::Client => (Side::Client, (id - 1) as usize),
            Side::Server => (Side::Server, (id - SERVER_ID_BASE) as usize),
        }
    }

    fn side(&self, side: Side) -> &Vec<Option<Entry<T>>> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Vec<Option<Entry<T>>> {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Store `value` in the lowest free slot of `side` and return its id.
    pub fn insert_new(&mut self, side: Side, value: T) -> Result<u32> {
        let slots = self.side_mut(side);
        let index = match slots.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                slots.push(None);
                slots.len() - 1
            }
        };
        let id = match side {
            Side::Client => {
                let id = index as u32 + 1;
                if id >= SERVER_ID_BASE {
                    return Err(WireError::IdExhausted);
                }
                id
            }
            Side::Server => SERVER_ID_BASE
                .checked_add(index as u32)
                .ok_or(WireError::IdExhausted)?,
        };
        slots[index] = Some(Entry::Live(value));
        Ok(id)
    }

    /// Store `value` at a peer-nominated id. Occupied slots (live or
    /// zombie) are never overwritten.
    pub fn insert_at(&mut self, id: u32, value: T) -> Result<()> {
        if id == 0 {
            return Err(WireError::BadArgument {
                reason: "id 0 is the nil sentinel",
            });
        }
        let (side, index) = Self::index(id);
        let slots = self.side_mut(side);
        if index >= slots.len() {
            slots.resize_with(index + 1, || None);
        }
        if slots[index].is_some() {
            return Err(WireError::IdInUse { id });
        }
        slots[index] = Some(Entry::Live(value));
        Ok(())
    }

    pub fn lookup(&self, id: u32) -> Lookup<'_, T> {
        if id == 0 {
            return Lookup::Vacant;
        }
        let (side, index) = Self::index(id);
        match self.side(side).get(index) {
            Some(Some(Entry::Live(value))) => Lookup::Live(value),
            Some(Some(Entry::Zombie)) => Lookup::Zombie,
            _ => Lookup::Vacant,
        }
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        match self.lookup(id) {
            Lookup::Live(value) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        if id == 0 {
            return None;
        }
        let (side, index) = Self::index(id);
        match self.side_mut(side).get_mut(index) {
            Some(Some(Entry::Live(value))) => Some(value),
            _ => None,
        }
    }

    /// Turn a live client-allocated slot into a zombie, returning the
    /// record. The slot stays reserved until [`remove`](Self::remove)
    /// is called on the peer's acknowledgement.
    pub fn make_zombie(&mut self, id: u32) -> Result<T> {
        if Side::of(id) != Side::Client {
            return Err(WireError::BadArgument {
                reason: "only client-allocated ids become zombies",
            });
        }
        let (_, index) = Self::index(id);
        let Some(slot) = self.client.get_mut(index) else {
            return Err(WireError::InvalidObject { id });
        };
        match slot.take() {
            Some(Entry::Live(value)) => {
                *slot = Some(Entry::Zombie);
                Ok(value)
            }
            other => {
                *slot = other;
                Err(WireError::InvalidObject { id })
            }
        }
    }

    /// Free a slot, returning whatever occupied it.
    pub fn remove(&mut self, id: u32) -> Option<Entry<T>> {
        if id == 0 {
            return None;
        }
        let (side, index) = Self::index(id);
        self.side_mut(side).get_mut(index).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_new_allocates_lowest_free() {
        let mut map = ObjectMap::new();
        assert_eq!(map.insert_new(Side::Client, "a").unwrap(), 1);
        assert_eq!(map.insert_new(Side::Client, "b").unwrap(), 2);
        assert_eq!(map.insert_new(Side::Client, "c").unwrap(), 3);

        map.remove(2);
        assert_eq!(map.insert_new(Side::Client, "d").unwrap(), 2);
    }

    #[test]
    fn server_side_ids_start_at_base() {
        let mut map = ObjectMap::new();
        assert_eq!(map.insert_new(Side::Server, "s").unwrap(), SERVER_ID_BASE);
        assert_eq!(
            map.insert_new(Side::Server, "t").unwrap(),
            SERVER_ID_BASE + 1
        );
        assert_eq!(Side::of(SERVER_ID_BASE), Side::Server);
        assert_eq!(Side::of(SERVER_ID_BASE - 1), Side::Client);
    }

    #[test]
    fn insert_at_rejects_occupied_slots() {
        let mut map = ObjectMap::new();
        map.insert_at(5, "x").unwrap();
        assert!(matches!(
            map.insert_at(5, "y"),
            Err(WireError::IdInUse { id: 5 })
        ));
        assert!(map.get(5).is_some());
    }

    #[test]
    fn insert_at_rejects_nil() {
        let mut map = ObjectMap::new();
        assert!(matches!(
            map.insert_at(0, "x"),
            Err(WireError::BadArgument { .. })
        ));
    }

    #[test]
    fn zombie_blocks_reuse_until_removed() {
        let mut map = ObjectMap::new();
        let id = map.insert_new(Side::Client, "a").unwrap();
        assert_eq!(map.make_zombie(id).unwrap(), "a");

        assert!(matches!(map.lookup(id), Lookup::Zombie));
        assert!(matches!(map.insert_at(id, "b"), Err(WireError::IdInUse { .. })));
        // insert_new must skip the zombie slot too.
        assert_eq!(map.insert_new(Side::Client, "c").unwrap(), id + 1);

        assert!(matches!(map.remove(id), Some(Entry::Zombie)));
        assert_eq!(map.insert_new(Side::Client, "d").unwrap(), id);
    }

    #[test]
    fn zombies_are_client_side_only() {
        let mut map = ObjectMap::new();
        let id = map.insert_new(Side::Server, "s").unwrap();
        assert!(matches!(
            map.make_zombie(id),
            Err(WireError::BadArgument { .. })
        ));
    }

    #[test]
    fn lookup_nil_is_vacant() {
        let map = ObjectMap::<()>::new();
        assert!(matches!(map.lookup(0), Lookup::Vacant));
    }

    #[test]
    fn remove_frees_server_slot_immediately() {
        let mut map = ObjectMap::new();
        let id = map.insert_new(Side::Server, "s").unwrap();
        assert!(matches!(map.remove(id), Some(Entry::Live("s"))));
        assert_eq!(map.insert_new(Side::Server, "t").unwrap(), id);
    }
}
