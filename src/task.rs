//! Task callables and their execution shapes.
//!
//! A [`TaskFn`] is resolved into one of four shapes when it is built, so
//! the hot path never inspects the callable again:
//!
//! | Shape | Produces |
//! |---|---|
//! | [`Shape::Function`] | one value per call, blocking |
//! | [`Shape::Generator`] | many values per call, blocking |
//! | [`Shape::AsyncFunction`] | one value per call, awaited |
//! | [`Shape::AsyncGenerator`] | many values per call, awaited |

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};

/// Result type returned by task callables.
pub type TaskResult<O> = anyhow::Result<O>;

/// Boxed iterator returned by generator-shaped callables.
pub type BoxIter<O> = Box<dyn Iterator<Item = TaskResult<O>> + Send>;

type FunctionBody<I, O> = Arc<dyn Fn(I) -> TaskResult<O> + Send + Sync>;
type GeneratorBody<I, O> = Arc<dyn Fn(I) -> BoxIter<O> + Send + Sync>;
type AsyncFunctionBody<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, TaskResult<O>> + Send + Sync>;
type AsyncGeneratorBody<I, O> =
    Arc<dyn Fn(I) -> BoxStream<'static, TaskResult<O>> + Send + Sync>;

/// Execution shape of a task callable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Function,
    Generator,
    AsyncFunction,
    AsyncGenerator,
}

impl Shape {
    /// True for shapes that must run on a cooperative scheduler.
    pub fn is_async(self) -> bool {
        matches!(self, Shape::AsyncFunction | Shape::AsyncGenerator)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Function => write!(f, "function"),
            Shape::Generator => write!(f, "generator"),
            Shape::AsyncFunction => write!(f, "async function"),
            Shape::AsyncGenerator => write!(f, "async generator"),
        }
    }
}

/// What a worker loop should make of one finished iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Work was done; loop again.
    Continue,
    /// Nothing was available; the callable already backed off.
    Idle,
    /// The poison value was received. The loop re-checks its stop flag
    /// without processing anything.
    Poisoned,
}

impl Flow {
    /// Signal carried by a task output. Outputs that are not a `Flow`
    /// are discarded and count as [`Flow::Continue`].
    pub fn of<O: Any>(out: &O) -> Flow {
        match (out as &dyn Any).downcast_ref::<Flow>() {
            Some(flow) => *flow,
            None => Flow::Continue,
        }
    }
}

pub(crate) enum Body<I, O> {
    Function(FunctionBody<I, O>),
    Generator(GeneratorBody<I, O>),
    AsyncFunction(AsyncFunctionBody<I, O>),
    AsyncGenerator(AsyncGeneratorBody<I, O>),
}

impl<I, O> Clone for Body<I, O> {
    fn clone(&self) -> Self {
        match self {
            Body::Function(f) => Body::Function(f.clone()),
            Body::Generator(f) => Body::Generator(f.clone()),
            Body::AsyncFunction(f) => Body::AsyncFunction(f.clone()),
            Body::AsyncGenerator(f) => Body::AsyncGenerator(f.clone()),
        }
    }
}

/// A named callable of a fixed [`Shape`], taking `I` and producing `O`.
pub struct TaskFn<I, O> {
    name: Arc<str>,
    pub(crate) body: Body<I, O>,
}

impl<I, O> Clone for TaskFn<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            body: self.body.clone(),
        }
    }
}

impl<I, O> fmt::Debug for TaskFn<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFn")
            .field("name", &self.name)
            .field("shape", &self.shape())
            .finish()
    }
}

impl<I: 'static, O: 'static> TaskFn<I, O> {
    /// A blocking callable returning one value.
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(I) -> TaskResult<O> + Send + Sync + 'static,
    {
        Self {
            name: callable_name::<F>().into(),
            body: Body::Function(Arc::new(f)),
        }
    }

    /// A blocking callable returning a sequence of values.
    pub fn generator<F, It>(f: F) -> Self
    where
        F: Fn(I) -> It + Send + Sync + 'static,
        It: IntoIterator<Item = TaskResult<O>>,
        It::IntoIter: Send + 'static,
    {
        Self {
            name: callable_name::<F>().into(),
            body: Body::Generator(Arc::new(move |input| Box::new(f(input).into_iter()) as BoxIter<O>)),
        }
    }

    /// An async callable resolving to one value.
    pub fn future<F, Fut>(f: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<O>> + Send + 'static,
    {
        Self {
            name: callable_name::<F>().into(),
            body: Body::AsyncFunction(Arc::new(move |input| f(input).boxed())),
        }
    }

    /// An async callable yielding a stream of values.
    pub fn stream<F, S>(f: F) -> Self
    where
        F: Fn(I) -> S + Send + Sync + 'static,
        S: Stream<Item = TaskResult<O>> + Send + 'static,
    {
        Self {
            name: callable_name::<F>().into(),
            body: Body::AsyncGenerator(Arc::new(move |input| f(input).boxed())),
        }
    }
}

impl<I, O> TaskFn<I, O> {
    /// Override the derived name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into().into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> Shape {
        match self.body {
            Body::Function(_) => Shape::Function,
            Body::Generator(_) => Shape::Generator,
            Body::AsyncFunction(_) => Shape::AsyncFunction,
            Body::AsyncGenerator(_) => Shape::AsyncGenerator,
        }
    }

    /// Invoke a blocking-shape callable, handing each produced value to
    /// `emit`. A panic is turned into an error.
    pub(crate) fn call_blocking(&self, input: I, mut emit: impl FnMut(O)) -> TaskResult<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| match &self.body {
            Body::Function(f) => f(input).map(&mut emit),
            Body::Generator(f) => {
                for value in f(input) {
                    emit(value?);
                }
                Ok(())
            }
            Body::AsyncFunction(_) | Body::AsyncGenerator(_) => Err(anyhow!(
                "{} '{}' cannot run on a blocking worker",
                self.shape(),
                self.name
            )),
        }));
        outcome.unwrap_or_else(|payload| Err(panic_error(payload)))
    }

    /// Invoke an async-shape callable, handing each produced value to
    /// `emit`. A stream stops early once `stop` is raised. A panic is turned
    /// into an error.
    pub(crate) async fn call_async(
        &self,
        input: I,
        mut emit: impl FnMut(O) + Send,
        stop: Option<&AtomicBool>,
    ) -> TaskResult<()>
    where
        I: Send,
        O: Send,
    {
        let run = async {
            match &self.body {
                Body::AsyncFunction(f) => f(input).await.map(&mut emit),
                Body::AsyncGenerator(f) => {
                    let mut stream = f(input);
                    while let Some(value) = stream.next().await {
                        emit(value?);
                        if stop.is_some_and(|s| s.load(Ordering::Acquire)) {
                            break;
                        }
                    }
                    Ok(())
                }
                Body::Function(_) | Body::Generator(_) => Err(anyhow!(
                    "{} '{}' cannot run on a cooperative worker",
                    self.shape(),
                    self.name
                )),
            }
        };
        AssertUnwindSafe(run)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panic_error(payload)))
    }
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow!("task panicked: {message}")
}

/// Short name for a callable type: the function name for fn items, the
/// enclosing function for closures.
pub(crate) fn callable_name<F>() -> String {
    let mut name = std::any::type_name::<F>();
    while let Some(stripped) = name.strip_suffix("::{{closure}}") {
        name = stripped;
    }
    let name = name.split('<').next().unwrap_or(name);
    name.rsplit("::").next().unwrap_or(name).to_string()
}
