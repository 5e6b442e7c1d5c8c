use std::path::Path;

use anyhow::{anyhow, Result};
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::{FullPrecisionSettings, Recorder},
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

const EXPANSION: usize = 4;

/// torchvision state-dict names mapped onto this module tree, applied in order.
const TORCHVISION_KEY_REMAP: [(&str, &str); 3] = [
    (r"layer([1-4])\.([0-9]+)\.(.+)", "layer$1.blocks.$2.$3"),
    (r"downsample\.0\.(.+)", "downsample.conv.$1"),
    (r"downsample\.1\.(.+)", "downsample.bn.$1"),
];

/// Residual backbone built from bottleneck blocks, without the ImageNet top.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Bottleneck blocks per stage.
    layers: [usize; 4],
}

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self::new([3, 4, 6, 3])
    }

    /// Channels produced by the last stage.
    pub fn out_channels(&self) -> usize {
        512 * EXPANSION
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let conv1 = Conv2dConfig::new([3, 64], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = BatchNormConfig::new(64).init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let layer1 = LayerBlock::new(self.layers[0], 64, 64, 1, device);
        let layer2 = LayerBlock::new(self.layers[1], 64 * EXPANSION, 128, 2, device);
        let layer3 = LayerBlock::new(self.layers[2], 128 * EXPANSION, 256, 2, device);
        let layer4 = LayerBlock::new(self.layers[3], 256 * EXPANSION, 512, 2, device);

        ResNet {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }

    /// Initialise the backbone and, when a torchvision state dict is given,
    /// load its weights. The `fc.*` entries of the file are ignored.
    pub fn init_pretrained<B: Backend>(&self, weights: Option<&Path>, device: &B::Device) -> Result<ResNet<B>> {
        let model = self.init(device);

        let Some(path) = weights else {
            log::warn!("No pretrained weights configured, backbone starts from random initialisation");
            return Ok(model);
        };
        if !path.exists() {
            return Err(anyhow!("Pretrained weights not found: {:?}", path));
        }

        let args = TORCHVISION_KEY_REMAP
            .iter()
            .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                args.with_key_remap(pattern, replacement)
            });
        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| anyhow!("Failed to load pretrained weights {:?}: {:?}", path, e))?;

        log::info!("Loaded pretrained backbone weights from {:?}", path);
        Ok(model.load_record(record))
    }
}

#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * EXPANSION;

        // Stride sits on the 3x3 conv (torchvision layout).
        let conv1 = Conv2dConfig::new([in_channels, planes], [1, 1]).with_bias(false).init(device);
        let conv2 = Conv2dConfig::new([planes, planes], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let conv3 = Conv2dConfig::new([planes, out_channels], [1, 1]).with_bias(false).init(device);

        let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1,
            bn1: BatchNormConfig::new(planes).init(device),
            conv2,
            bn2: BatchNormConfig::new(planes).init(device),
            conv3,
            bn3: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            downsample,
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(ds) => ds.bn.forward(ds.conv.forward(input.clone())),
            None => input.clone(),
        };

        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.relu.forward(self.bn2.forward(self.conv2.forward(x)));
        let x = self.bn3.forward(self.conv3.forward(x));

        self.relu.forward(x.add(identity))
    }
}

#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<Bottleneck<B>>,
}

impl<B: Backend> LayerBlock<B> {
    fn new(num_blocks: usize, in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let blocks = (0..num_blocks)
            .map(|i| {
                if i == 0 {
                    Bottleneck::new(in_channels, planes, stride, device)
                } else {
                    Bottleneck::new(planes * EXPANSION, planes, 1, device)
                }
            })
            .collect();

        Self { blocks }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(input, |x, block| block.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
}

impl<B: Backend> ResNet<B> {
    /// Feature maps `[batch, 2048, H/32, W/32]`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(self.conv1.forward(input)));
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        self.layer4.forward(x)
    }
}

/// New classification head: global average pooling, one hidden ReLU layer,
/// and one logit per class (sigmoid outputs, multi-label).
#[derive(Config, Debug)]
pub struct OcularHeadConfig {
    in_channels: usize,
    num_classes: usize,
    #[config(default = 1024)]
    hidden_units: usize,
}

impl OcularHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> OcularHead<B> {
        OcularHead {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(self.in_channels, self.hidden_units).init(device),
            fc2: LinearConfig::new(self.hidden_units, self.num_classes).init(device),
            relu: Relu::new(),
        }
    }
}

#[derive(Module, Debug)]
pub struct OcularHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    fc1: Linear<B>,
    fc2: Linear<B>,
    relu: Relu,
}

impl<B: Backend> OcularHead<B> {
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.relu.forward(self.fc1.forward(x));
        self.fc2.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct OcularModelConfig {
    backbone: ResNetConfig,
    num_classes: usize,
    #[config(default = 1024)]
    hidden_units: usize,
}

impl OcularModelConfig {
    pub fn resnet50(num_classes: usize) -> Self {
        Self::new(ResNetConfig::resnet50(), num_classes)
    }

    fn head(&self) -> OcularHeadConfig {
        OcularHeadConfig::new(self.backbone.out_channels(), self.num_classes).with_hidden_units(self.hidden_units)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> OcularModel<B> {
        OcularModel {
            backbone: self.backbone.init(device),
            head: self.head().init(device),
        }
    }

    pub fn init_pretrained<B: Backend>(&self, weights: Option<&Path>, device: &B::Device) -> Result<OcularModel<B>> {
        Ok(OcularModel {
            backbone: self.backbone.init_pretrained(weights, device)?,
            head: self.head().init(device),
        })
    }
}

#[derive(Module, Debug)]
pub struct OcularModel<B: Backend> {
    pub backbone: ResNet<B>,
    pub head: OcularHead<B>,
}

impl<B: Backend> OcularModel<B> {
    /// Logits `[batch, num_classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Per-class probabilities in `[0, 1]`.
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }

    /// Text rendering of the layer tree with parameter counts.
    pub fn summary(&self, frozen_backbone: bool) -> String {
        let backbone_params = self.backbone.num_params();
        let head_params = self.head.num_params();
        let (trainable, frozen) = if frozen_backbone {
            (head_params, backbone_params)
        } else {
            (backbone_params + head_params, 0)
        };

        format!(
            "{}\n\nTotal params: {}\nTrainable params: {}\nNon-trainable params: {}\n",
            self,
            backbone_params + head_params,
            trainable,
            frozen
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{backend::NdArray, record::PrettyJsonFileRecorder};

    type TestBackend = NdArray;

    fn tiny_config() -> OcularModelConfig {
        OcularModelConfig::new(ResNetConfig::new([1, 1, 1, 1]), 8).with_hidden_units(16)
    }

    fn remap(key: &str) -> String {
        TORCHVISION_KEY_REMAP.iter().fold(key.to_string(), |name, (pattern, replacement)| {
            regex::Regex::new(pattern).unwrap().replace_all(&name, *replacement).to_string()
        })
    }

    fn lookup<'a>(root: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
        key.split('.').try_fold(root, |node, part| match part.parse::<usize>() {
            Ok(index) => node.get(index),
            Err(_) => node.get(part),
        })
    }

    #[test]
    fn torchvision_keys_resolve_in_backbone_record() {
        let dir = tempfile::tempdir().unwrap();
        let backbone = ResNetConfig::new([1, 1, 1, 1]).init::<TestBackend>(&Default::default());
        backbone
            .save_file(dir.path().join("backbone"), &PrettyJsonFileRecorder::<FullPrecisionSettings>::new())
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("backbone.json")).unwrap()).unwrap();
        let record = &json["item"];

        assert_eq!(remap("layer2.0.conv2.weight"), "layer2.blocks.0.conv2.weight");
        assert_eq!(remap("layer3.0.downsample.0.weight"), "layer3.blocks.0.downsample.conv.weight");
        assert_eq!(remap("layer4.0.downsample.1.running_var"), "layer4.blocks.0.downsample.bn.running_var");
        assert_eq!(remap("bn1.running_mean"), "bn1.running_mean");

        for key in [
            "conv1.weight",
            "bn1.running_mean",
            "layer1.0.conv1.weight",
            "layer1.0.bn3.running_var",
            "layer1.0.downsample.0.weight",
            "layer1.0.downsample.1.running_mean",
            "layer4.0.conv3.weight",
        ] {
            assert!(lookup(record, &remap(key)).is_some(), "{} -> {} not in record", key, remap(key));
        }
        assert!(lookup(record, "layer1.0.conv1.weight").is_none());
    }

    #[test]
    fn resnet50_has_expected_depth() {
        let device = Default::default();
        let backbone = ResNetConfig::resnet50().init::<TestBackend>(&device);
        assert_eq!(backbone.layer1.blocks.len(), 3);
        assert_eq!(backbone.layer3.blocks.len(), 6);
        assert!(backbone.layer1.blocks[0].downsample.is_some());
        assert!(backbone.layer1.blocks[1].downsample.is_none());
        assert_eq!(backbone.layer4.blocks.len(), 3);
    }

    #[test]
    fn backbone_reduces_resolution_by_32() {
        let device = Default::default();
        let config = ResNetConfig::new([1, 1, 1, 1]);
        let backbone = config.init::<TestBackend>(&device);

        let features = backbone.forward(Tensor::zeros([2, 3, 64, 64], &device));
        assert_eq!(features.dims(), [2, config.out_channels(), 2, 2]);
    }

    #[test]
    fn model_outputs_one_probability_per_class() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let probs = model.predict(Tensor::ones([3, 3, 32, 32], &device));
        assert_eq!(probs.dims(), [3, 8]);

        let values: Vec<f32> = probs.into_data().to_vec().unwrap();
        assert!(values.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn missing_weights_file_is_an_error() {
        let device = Default::default();
        let result = tiny_config().init_pretrained::<TestBackend>(Some(Path::new("does/not/exist.pth")), &device);
        assert!(result.is_err());
    }

    #[test]
    fn summary_splits_trainable_and_frozen() {
        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);

        let summary = model.summary(true);
        let head = model.head.num_params();
        assert!(summary.contains(&format!("Trainable params: {}", head)));
        assert!(summary.contains(&format!("Non-trainable params: {}", model.backbone.num_params())));
    }
}
