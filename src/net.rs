//! Feed-forward layers and networks.
//!
//! Every layer kind is a variant of [`Layer`]. A layer maps a packed batch of `batch` inputs to a
//! packed batch of outputs, building a fresh graph on every call.

use crate::{
    autodiff::{ResRef, Var},
    conv::{BatchNorm, Conv, MaxPool, MeanPool, Padding, Residual, Resize},
    error::{Error, Result},
    serializer::{self, BuildOptions, Codec, Tagged},
};

mod activation;
mod affine;
pub mod cost;
mod debug;
mod dropout;
mod fc;
mod mixer;

pub use activation::Activation;
pub use affine::{Affine, ConstAffine};
pub use debug::DebugLayer;
pub use dropout::Dropout;
pub use fc::Fc;
pub use mixer::AddMixer;

/// A differentiable function from one batch to another.
#[derive(Clone, Debug)]
pub enum Layer {
    /// Layers applied in sequence.
    Net(Net),
    /// Fully-connected layer.
    Fc(Fc),
    /// Learnable elementwise scale and shift.
    Affine(Affine),
    /// Constant scale and shift.
    ConstAffine(ConstAffine),
    /// Parameter-free nonlinearity.
    Activation(Activation),
    /// Dropout regularizer.
    Dropout(Dropout),
    /// Pass-through logging statistics.
    Debug(DebugLayer),
    /// Wrapper hiding the parameters of a layer from training.
    ParamHider(ParamHider),
    /// 2D convolution.
    Conv(Conv),
    /// Max pooling.
    MaxPool(MaxPool),
    /// Mean pooling.
    MeanPool(MeanPool),
    /// Batch normalization.
    BatchNorm(BatchNorm),
    /// Residual connection.
    Residual(Box<Residual>),
    /// Bilinear resizing.
    Resize(Resize),
    /// Zero padding.
    Padding(Padding),
}

macro_rules! layer_from {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for Layer {
                fn from(l: $ty) -> Self {
                    Layer::$variant(l)
                }
            }
        )*
    };
}

layer_from!(
    Net(Net),
    Fc(Fc),
    Affine(Affine),
    ConstAffine(ConstAffine),
    Activation(Activation),
    Dropout(Dropout),
    Debug(DebugLayer),
    ParamHider(ParamHider),
    Conv(Conv),
    MaxPool(MaxPool),
    MeanPool(MeanPool),
    BatchNorm(BatchNorm),
    Resize(Resize),
    Padding(Padding),
);

impl From<Residual> for Layer {
    fn from(r: Residual) -> Self {
        Layer::Residual(Box::new(r))
    }
}

impl Layer {
    /// Apply the layer to a packed batch of `batch` inputs.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        match self {
            Layer::Net(l) => l.apply(input, batch),
            Layer::Fc(l) => l.apply(input, batch),
            Layer::Affine(l) => l.apply(input, batch),
            Layer::ConstAffine(l) => l.apply(input, batch),
            Layer::Activation(l) => l.apply(input, batch),
            Layer::Dropout(l) => l.apply(input, batch),
            Layer::Debug(l) => l.apply(input, batch),
            Layer::ParamHider(l) => l.layer.apply(input, batch),
            Layer::Conv(l) => l.apply(input, batch),
            Layer::MaxPool(l) => l.apply(input, batch),
            Layer::MeanPool(l) => l.apply(input, batch),
            Layer::BatchNorm(l) => l.apply(input, batch),
            Layer::Residual(l) => l.apply(input, batch),
            Layer::Resize(l) => l.apply(input, batch),
            Layer::Padding(l) => l.apply(input, batch),
        }
    }

    /// Return the trainable variables.
    pub fn parameters(&self) -> Vec<Var> {
        match self {
            Layer::Net(l) => l.parameters(),
            Layer::Fc(l) => l.parameters(),
            Layer::Affine(l) => l.parameters(),
            Layer::Conv(l) => l.parameters(),
            Layer::BatchNorm(l) => l.parameters(),
            Layer::Residual(l) => l.parameters(),
            Layer::ConstAffine(_)
            | Layer::Activation(_)
            | Layer::Dropout(_)
            | Layer::Debug(_)
            | Layer::ParamHider(_)
            | Layer::MaxPool(_)
            | Layer::MeanPool(_)
            | Layer::Resize(_)
            | Layer::Padding(_) => Vec::new(),
        }
    }

    /// Return the type identifier written when serializing.
    pub fn type_id(&self) -> &'static str {
        match self {
            Layer::Net(_) => Net::TYPE_ID,
            Layer::Fc(_) => Fc::TYPE_ID,
            Layer::Affine(_) => Affine::TYPE_ID,
            Layer::ConstAffine(_) => ConstAffine::TYPE_ID,
            Layer::Activation(_) => Activation::TYPE_ID,
            Layer::Dropout(_) => Dropout::TYPE_ID,
            Layer::Debug(_) => DebugLayer::TYPE_ID,
            Layer::ParamHider(_) => ParamHider::TYPE_ID,
            Layer::Conv(_) => Conv::TYPE_ID,
            Layer::MaxPool(_) => MaxPool::TYPE_ID,
            Layer::MeanPool(_) => MeanPool::TYPE_ID,
            Layer::BatchNorm(_) => BatchNorm::TYPE_ID,
            Layer::Residual(_) => Residual::TYPE_ID,
            Layer::Resize(_) => Resize::TYPE_ID,
            Layer::Padding(_) => Padding::TYPE_ID,
        }
    }

    /// Encode the layer with its type identifier.
    pub fn to_tagged(&self) -> Result<Tagged> {
        match self {
            Layer::Net(l) => Tagged::new(l),
            Layer::Fc(l) => Tagged::new(l),
            Layer::Affine(l) => Tagged::new(l),
            Layer::ConstAffine(l) => Tagged::new(l),
            Layer::Activation(l) => Tagged::new(l),
            Layer::Dropout(l) => Tagged::new(l),
            Layer::Debug(l) => Tagged::new(l),
            Layer::ParamHider(l) => Tagged::new(l),
            Layer::Conv(l) => Tagged::new(l),
            Layer::MaxPool(l) => Tagged::new(l),
            Layer::MeanPool(l) => Tagged::new(l),
            Layer::BatchNorm(l) => Tagged::new(l),
            Layer::Residual(l) => Tagged::new(l.as_ref()),
            Layer::Resize(l) => Tagged::new(l),
            Layer::Padding(l) => Tagged::new(l),
        }
    }

    /// Decode a tagged record of any layer kind.
    pub fn from_tagged(t: &Tagged, opts: &BuildOptions) -> Result<Self> {
        let layer = match t.type_id.as_str() {
            id if id == Net::TYPE_ID => Layer::Net(t.decode(opts)?),
            id if id == Fc::TYPE_ID => Layer::Fc(t.decode(opts)?),
            id if id == Affine::TYPE_ID => Layer::Affine(t.decode(opts)?),
            id if id == ConstAffine::TYPE_ID => Layer::ConstAffine(t.decode(opts)?),
            id if id == Activation::TYPE_ID => Layer::Activation(t.decode(opts)?),
            id if id == Dropout::TYPE_ID => Layer::Dropout(t.decode(opts)?),
            id if id == DebugLayer::TYPE_ID => Layer::Debug(t.decode(opts)?),
            id if id == ParamHider::TYPE_ID => Layer::ParamHider(t.decode(opts)?),
            id if id == Conv::TYPE_ID => Layer::Conv(t.decode(opts)?),
            id if id == MaxPool::TYPE_ID => Layer::MaxPool(t.decode(opts)?),
            id if id == MeanPool::TYPE_ID => Layer::MeanPool(t.decode(opts)?),
            id if id == BatchNorm::TYPE_ID => Layer::BatchNorm(t.decode(opts)?),
            id if id == Residual::TYPE_ID => Layer::Residual(Box::new(t.decode(opts)?)),
            id if id == Resize::TYPE_ID => Layer::Resize(t.decode(opts)?),
            id if id == Padding::TYPE_ID => Layer::Padding(t.decode(opts)?),
            other => return Err(Error::UnknownType(other.to_owned())),
        };
        Ok(layer)
    }

    /// Serialize the layer as a standalone tagged record.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serializer::to_bytes(&self.to_tagged()?)
    }

    /// Deserialize a layer of any kind, rejecting trailing data.
    pub fn deserialize(data: &[u8], opts: &BuildOptions) -> Result<Self> {
        Self::from_tagged(&serializer::from_bytes(data)?, opts)
    }
}

/// A sequence of layers applied in order.
#[derive(Clone, Debug, Default)]
pub struct Net(pub Vec<Layer>);

impl FromIterator<Layer> for Net {
    fn from_iter<I: IntoIterator<Item = Layer>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Net {
    /// Apply every layer in turn.
    pub fn apply(&self, input: ResRef, batch: usize) -> ResRef {
        self.0.iter().fold(input, |x, l| l.apply(x, batch))
    }

    /// Return the parameters of every layer, in order.
    pub fn parameters(&self) -> Vec<Var> {
        self.0.iter().flat_map(Layer::parameters).collect()
    }
}

impl Codec for Net {
    const TYPE_ID: &'static str = "anynet.Net";
    type Record = Vec<Tagged>;

    fn to_record(&self) -> Result<Vec<Tagged>> {
        self.0.iter().map(Layer::to_tagged).collect()
    }

    fn from_record(layers: Vec<Tagged>, opts: &BuildOptions) -> Result<Self> {
        layers
            .iter()
            .map(|t| Layer::from_tagged(t, opts))
            .collect::<Result<_>>()
            .map(Self)
    }
}

/// Applies a layer while reporting no parameters, which freezes it during training.
#[derive(Clone, Debug)]
pub struct ParamHider {
    /// The wrapped layer.
    pub layer: Box<Layer>,
}

impl ParamHider {
    /// Wrap a layer.
    pub fn new<L: Into<Layer>>(layer: L) -> Self {
        Self {
            layer: Box::new(layer.into()),
        }
    }
}

impl Codec for ParamHider {
    const TYPE_ID: &'static str = "anynet.ParamHider";
    type Record = Tagged;

    fn to_record(&self) -> Result<Tagged> {
        self.layer.to_tagged()
    }

    fn from_record(layer: Tagged, opts: &BuildOptions) -> Result<Self> {
        Ok(Self {
            layer: Box::new(Layer::from_tagged(&layer, opts)?),
        })
    }
}
