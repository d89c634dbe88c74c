use std::{
    cell::{Ref, RefCell, RefMut},
    rc::{Rc, Weak},
};

use derive_more::{Display, From};

use crate::{
    Error, Result, ShapeError,
    core::{Field, Shape, StateBuffer, Window},
};

pub(crate) type SharedState = Rc<RefCell<StateBuffer>>;

/// Index of a buffer inside a [`StateArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
#[display("#{_0}")]
pub struct StateHandle(usize);

impl StateHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Owner of the hidden buffers of one chain.
///
/// Buffers are addressed by [`StateHandle`]s. Borrows are checked per buffer at run time: asking
/// for a buffer that is already mutably borrowed, or mutably borrowing one that is already read,
/// fails with [`Error::AliasConflict`] instead of letting two roles share storage.
#[derive(Debug, Default)]
pub struct StateArena {
    slots: Vec<SharedState>,
}

impl StateArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, state: StateBuffer) -> StateHandle {
        self.adopt(Rc::new(RefCell::new(state)))
    }

    /// Takes over a buffer from another arena. Views into it stay valid.
    pub(crate) fn adopt(&mut self, slot: SharedState) -> StateHandle {
        let handle = StateHandle(self.slots.len());
        self.slots.push(slot);
        handle
    }

    pub(crate) fn shared(&self, handle: StateHandle) -> Result<SharedState> {
        self.slot(handle).cloned()
    }

    /// Number of buffers owned by the arena.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = StateHandle> + use<> {
        (0..self.slots.len()).map(StateHandle)
    }

    fn slot(&self, handle: StateHandle) -> Result<&SharedState> {
        self.slots
            .get(handle.0)
            .ok_or(Error::UnknownHandle(handle))
    }

    pub fn get(&self, handle: StateHandle) -> Result<Ref<'_, StateBuffer>> {
        self.slot(handle)?
            .try_borrow()
            .map_err(|_| Error::AliasConflict(handle))
    }

    pub fn get_mut(&self, handle: StateHandle) -> Result<RefMut<'_, StateBuffer>> {
        self.slot(handle)?
            .try_borrow_mut()
            .map_err(|_| Error::AliasConflict(handle))
    }

    /// Weak view of a whole buffer.
    pub fn view(&self, handle: StateHandle) -> Result<StateView> {
        Ok(StateView {
            handle,
            slot: Rc::downgrade(self.slot(handle)?),
            window: None,
        })
    }

    /// Weak view of a window of a buffer.
    pub fn narrow(&self, handle: StateHandle, window: Window) -> Result<StateView> {
        self.view(handle)?.narrow(window)
    }

    /// Zeroes `field` of every buffer.
    pub fn clear(&self, field: Field) -> Result<()> {
        for handle in self.handles() {
            self.get_mut(handle)?.clear(field);
        }
        Ok(())
    }
}

/// Weak, non-owning alias into a buffer owned by a [`StateArena`], optionally restricted to a
/// window along one axis.
#[derive(Debug, Clone)]
pub struct StateView {
    handle: StateHandle,
    slot: Weak<RefCell<StateBuffer>>,
    window: Option<Window>,
}

impl StateView {
    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn window(&self) -> Option<Window> {
        self.window
    }

    /// Narrows the view. A view that is already narrowed can only be narrowed again along the
    /// same axis.
    pub fn narrow(&self, window: Window) -> Result<StateView> {
        let window = match self.window {
            None => window,
            Some(outer) if outer.axis == window.axis => {
                if window.offset + window.len > outer.len {
                    return Err(ShapeError::WindowOutOfRange {
                        axis: window.axis,
                        len: window.len,
                        offset: window.offset,
                        extent: outer.len,
                    }
                    .into());
                }
                Window::new(outer.axis, window.len, outer.offset + window.offset)
            }
            Some(outer) => {
                return Err(Error::shape_mismatch(
                    &self.handle.to_string(),
                    format!("a window along axis {}", outer.axis),
                    format!("a window along axis {}", window.axis),
                ));
            }
        };
        let view = StateView {
            window: Some(window),
            ..self.clone()
        };
        // Fail early on windows that do not fit the owner.
        view.shape()?;
        Ok(view)
    }

    fn owner(&self) -> Result<SharedState> {
        self.slot.upgrade().ok_or(Error::DanglingView(self.handle))
    }

    pub fn is_dangling(&self) -> bool {
        self.slot.strong_count() == 0
    }

    pub fn shape(&self) -> Result<Shape> {
        let owner = self.owner()?;
        let owner = owner
            .try_borrow()
            .map_err(|_| Error::AliasConflict(self.handle))?;
        match self.window {
            None => Ok(owner.shape().clone()),
            Some(window) => Ok(window.shape_in(owner.shape())?),
        }
    }

    /// Copy of the viewed region, all three fields.
    pub fn load(&self) -> Result<StateBuffer> {
        let owner = self.owner()?;
        let owner = owner
            .try_borrow()
            .map_err(|_| Error::AliasConflict(self.handle))?;
        match self.window {
            None => Ok(owner.clone()),
            Some(window) => Ok(owner.narrow(window)?),
        }
    }

    /// Overwrites `field` of the viewed region with `src.field`.
    pub fn store(&self, field: Field, src: &StateBuffer) -> Result<()> {
        self.update(|owner, window| owner.store_window(window, field, src))
    }

    /// `field` of the viewed region `+= src.field`.
    pub fn accumulate(&self, field: Field, src: &StateBuffer) -> Result<()> {
        self.update(|owner, window| owner.add_window(window, field, src))
    }

    /// Resizes the viewed region. A whole-buffer view resizes its owner; a narrowed view cannot
    /// change geometry and only accepts its current shape.
    pub fn resize(&self, shape: &Shape) -> Result<()> {
        let owner = self.owner()?;
        let mut owner = owner
            .try_borrow_mut()
            .map_err(|_| Error::AliasConflict(self.handle))?;
        match self.window {
            None => {
                owner.resize(shape);
                Ok(())
            }
            Some(window) => {
                let view = window.shape_in(owner.shape())?;
                if &view != shape {
                    return Err(ShapeError::ViewResize {
                        view,
                        requested: shape.clone(),
                    }
                    .into());
                }
                Ok(())
            }
        }
    }

    fn update(
        &self,
        f: impl FnOnce(&mut StateBuffer, Window) -> Result<(), ShapeError>,
    ) -> Result<()> {
        let owner = self.owner()?;
        let mut owner = owner
            .try_borrow_mut()
            .map_err(|_| Error::AliasConflict(self.handle))?;
        let window = match self.window {
            Some(window) => window,
            // A rank 0 buffer has no axis to window over; treat it as a one element vector.
            None if owner.rank() == 0 => {
                let n = owner.n_elements();
                let shape = owner.shape().clone();
                owner.resize(&Shape::new([n]));
                let result = f(&mut owner, Window::new(0, n, 0));
                owner.resize(&shape);
                return Ok(result?);
            }
            None => Window::new(0, owner.shape()[0], 0),
        };
        Ok(f(&mut owner, window)?)
    }
}
