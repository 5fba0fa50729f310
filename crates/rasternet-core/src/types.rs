//! Closed enumerations of supported op kinds and layer classes.
//!
//! Op names from graph models and class names from layers models are mapped
//! to these enums once, at the model boundary. Anything unknown becomes an
//! explicit `Unsupported` variant that fails at compile time.

use std::fmt;

/// Operation kind of a graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Runtime input.
    Placeholder,
    /// Weight or other constant tensor.
    Const,
    /// Passthrough; removed by the scheduler.
    Identity,
    Add,
    Mul,
    Relu,
    Conv2D,
    /// Convolution with bias and optional activation in one pass.
    FusedConv2D,
    DepthwiseConv2D,
    /// Depthwise convolution with bias and optional activation in one pass.
    FusedDepthwiseConv2D,
    ResizeBilinear,
    /// An op with no raster program, carrying its original name.
    Unsupported(String),
}

impl OpKind {
    /// Map a graph-model op name.
    pub fn from_graph_op(op: &str) -> Self {
        match op {
            "Placeholder" => OpKind::Placeholder,
            "Const" => OpKind::Const,
            "Identity" => OpKind::Identity,
            "Add" | "AddV2" => OpKind::Add,
            "Mul" => OpKind::Mul,
            "Relu" => OpKind::Relu,
            "Conv2D" => OpKind::Conv2D,
            "_FusedConv2D" => OpKind::FusedConv2D,
            "DepthwiseConv2D" | "DepthwiseConv2dNative" => OpKind::DepthwiseConv2D,
            "FusedDepthwiseConv2dNative" => OpKind::FusedDepthwiseConv2D,
            "ResizeBilinear" => OpKind::ResizeBilinear,
            other => OpKind::Unsupported(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            OpKind::Placeholder => "Placeholder",
            OpKind::Const => "Const",
            OpKind::Identity => "Identity",
            OpKind::Add => "Add",
            OpKind::Mul => "Mul",
            OpKind::Relu => "Relu",
            OpKind::Conv2D => "Conv2D",
            OpKind::FusedConv2D => "FusedConv2D",
            OpKind::DepthwiseConv2D => "DepthwiseConv2D",
            OpKind::FusedDepthwiseConv2D => "FusedDepthwiseConv2D",
            OpKind::ResizeBilinear => "ResizeBilinear",
            OpKind::Unsupported(name) => name,
        }
    }

    /// Placeholder and Const nodes hold data and never get a program.
    pub fn is_data(&self) -> bool {
        matches!(self, OpKind::Placeholder | OpKind::Const)
    }

    pub fn is_convolution(&self) -> bool {
        matches!(
            self,
            OpKind::Conv2D
                | OpKind::FusedConv2D
                | OpKind::DepthwiseConv2D
                | OpKind::FusedDepthwiseConv2D
        )
    }

    pub fn is_depthwise(&self) -> bool {
        matches!(
            self,
            OpKind::DepthwiseConv2D | OpKind::FusedDepthwiseConv2D
        )
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, OpKind::FusedConv2D | OpKind::FusedDepthwiseConv2D)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, OpKind::Unsupported(_))
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Class of a layer in a layers model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerClass {
    InputLayer,
    Conv2D,
    DepthwiseConv2D,
    ReLU,
    /// Generic activation layer; only `relu` is supported.
    Activation,
    Add,
    Multiply,
    UpSampling2D,
    Unsupported(String),
}

impl LayerClass {
    pub fn from_class_name(class_name: &str) -> Self {
        match class_name {
            "InputLayer" => LayerClass::InputLayer,
            "Conv2D" => LayerClass::Conv2D,
            "DepthwiseConv2D" => LayerClass::DepthwiseConv2D,
            "ReLU" => LayerClass::ReLU,
            "Activation" => LayerClass::Activation,
            "Add" => LayerClass::Add,
            "Multiply" => LayerClass::Multiply,
            "UpSampling2D" => LayerClass::UpSampling2D,
            other => LayerClass::Unsupported(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_op_aliases() {
        assert_eq!(OpKind::from_graph_op("AddV2"), OpKind::Add);
        assert_eq!(
            OpKind::from_graph_op("DepthwiseConv2dNative"),
            OpKind::DepthwiseConv2D
        );
        assert_eq!(
            OpKind::from_graph_op("FusedDepthwiseConv2dNative"),
            OpKind::FusedDepthwiseConv2D
        );
    }

    #[test]
    fn test_unknown_op_is_unsupported() {
        let kind = OpKind::from_graph_op("MatMul");
        assert!(kind.is_unsupported());
        assert_eq!(kind.to_string(), "MatMul");
    }

    #[test]
    fn test_layer_classes() {
        assert_eq!(LayerClass::from_class_name("ReLU"), LayerClass::ReLU);
        assert_eq!(
            LayerClass::from_class_name("Dense"),
            LayerClass::Unsupported("Dense".to_string())
        );
    }
}
