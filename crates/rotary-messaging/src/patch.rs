use crate::{Control, ReplyHandler};

/// Intercepts deliveries on a bus.
///
/// Patches are consulted in installation order before a control's own
/// handler runs; the first one that selects the control handles the
/// delivery instead. The original handler is passed along so the patch can
/// wrap it.
pub trait MessagePatch<P>: Send {
  /// Selection sees only the control. The handler is opaque here and is
  /// handed over in [`MessagePatch::apply`] once the patch is chosen.
  fn selects(&self, control: &Control<P>) -> bool;

  fn apply(&mut self, control: &mut Control<P>, original: &mut ReplyHandler<P>) -> Option<P>;
}

type Selector<P> = Box<dyn Fn(&Control<P>) -> bool + Send>;
type Patcher<P> = Box<dyn FnMut(&mut Control<P>, &mut ReplyHandler<P>) -> Option<P> + Send>;

/// A [`MessagePatch`] made of two closures.
pub struct MessagePatcher<P> {
  selector: Selector<P>,
  patcher: Patcher<P>,
}

impl<P> MessagePatcher<P> {
  pub fn new(
    selector: impl Fn(&Control<P>) -> bool + Send + 'static,
    patcher: impl FnMut(&mut Control<P>, &mut ReplyHandler<P>) -> Option<P> + Send + 'static,
  ) -> Self {
    Self {
      selector: Box::new(selector),
      patcher: Box::new(patcher),
    }
  }
}

impl<P> MessagePatch<P> for MessagePatcher<P> {
  fn selects(&self, control: &Control<P>) -> bool {
    (self.selector)(control)
  }

  fn apply(&mut self, control: &mut Control<P>, original: &mut ReplyHandler<P>) -> Option<P> {
    (self.patcher)(control, original)
  }
}

impl<P, T: MessagePatch<P> + ?Sized> MessagePatch<P> for Box<T> {
  fn selects(&self, control: &Control<P>) -> bool {
    (**self).selects(control)
  }

  fn apply(&mut self, control: &mut Control<P>, original: &mut ReplyHandler<P>) -> Option<P> {
    (**self).apply(control, original)
  }
}
