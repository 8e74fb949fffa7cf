// Copyright 2024 The SensorNet Testbed Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Mutex as StdMutex;
pub use std::sync::MutexGuard;

/// A `std::sync::Mutex` that unwraps poisoned locks.
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized> {
    lock: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            lock: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.lock.into_inner().unwrap()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<T> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("mutex is poisoned"),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.lock.get_mut() {
            Ok(value) => value,
            Err(_) => panic!("mutex is poisoned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_mutate() {
        let m = Mutex::new(5u32);
        *m.lock() += 1;
        assert_eq!(m.into_inner(), 6);
    }

    #[test]
    fn get_mut() {
        let mut m = Mutex::new(String::from("a"));
        m.get_mut().push('b');
        assert_eq!(&*m.lock(), "ab");
    }
}
