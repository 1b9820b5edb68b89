//! Two-generation field storage.

/// A pair of buffer generations with a sense bit naming the current one.
///
/// Swapping flips the bit; no data moves.
#[derive(Clone, Debug)]
pub struct DoubleBuffer<T> {
    gens: [T; 2],
    sense: usize,
}

impl<T: Clone> DoubleBuffer<T> {
    /// Start with `init` as the current generation and a copy as next.
    pub fn new(init: T) -> Self {
        Self { gens: [init.clone(), init], sense: 0 }
    }
}

impl<T> DoubleBuffer<T> {
    pub fn sense(&self) -> usize { self.sense }

    pub fn current(&self) -> &T { &self.gens[self.sense] }

    pub fn current_mut(&mut self) -> &mut T { &mut self.gens[self.sense] }

    pub fn next(&self) -> &T { &self.gens[1 - self.sense] }

    pub fn next_mut(&mut self) -> &mut T { &mut self.gens[1 - self.sense] }

    /// Make the next generation current.
    pub fn swap(&mut self) { self.sense = 1 - self.sense; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_flips_roles_without_copying() {
        let mut buf = DoubleBuffer::new(vec![0; 3]);
        buf.next_mut().copy_from_slice(&[1, 2, 3]);
        assert_eq!(buf.current(), &vec![0; 3]);
        let ptr = buf.next().as_ptr();
        buf.swap();
        assert_eq!(buf.sense(), 1);
        assert_eq!(buf.current(), &vec![1, 2, 3]);
        assert_eq!(buf.current().as_ptr(), ptr);
        buf.swap();
        assert_eq!(buf.current(), &vec![0; 3]);
    }
}
