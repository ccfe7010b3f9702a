//! Builder entrypoints for function descriptors.

use crate::dialect::{
    Direction, ElementType, FunctionDescriptor, NativeRoutine, ParamKind, Parameter, ReturnType,
};
use crate::record::InstanceRecord;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct FunctionBuilder {
    name: String,
    return_type: ReturnType,
    parameters: Vec<Parameter>,
    source: String,
    dependencies: Vec<Arc<FunctionDescriptor>>,
    native: Option<NativeRoutine>,
}

impl FunctionBuilder {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn returns(mut self, element: ElementType) -> Self {
        self.return_type = ReturnType::Scalar(element);
        self
    }

    pub fn param(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }

    pub fn params<I>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = Parameter>,
    {
        self.parameters.extend(parameters);
        self
    }

    pub fn scalar<N: Into<String>>(self, name: N, element: ElementType) -> Self {
        self.param(Parameter::new(name, Direction::In, ParamKind::Scalar, element))
    }

    pub fn array<N: Into<String>>(
        self,
        name: N,
        direction: Direction,
        element: ElementType,
    ) -> Self {
        self.param(Parameter::new(name, direction, ParamKind::Array, element))
    }

    pub fn source<S: Into<String>>(mut self, source: S) -> Self {
        self.source = source.into();
        self
    }

    pub fn depends_on(mut self, dependency: Arc<FunctionDescriptor>) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn dependencies<I>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = Arc<FunctionDescriptor>>,
    {
        self.dependencies.extend(dependencies);
        self
    }

    pub fn native<F>(mut self, routine: F) -> Self
    where
        F: Fn(&mut InstanceRecord) -> Result<Option<f64>> + Send + Sync + 'static,
    {
        self.native = Some(Arc::new(routine));
        self
    }

    pub fn native_shared(mut self, routine: NativeRoutine) -> Self {
        self.native = Some(routine);
        self
    }

    pub fn build(self) -> Result<Arc<FunctionDescriptor>> {
        if self.name.is_empty() {
            bail!("function descriptor requires a name");
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.source_name()) {
                bail!(
                    "function `{}` declares parameter `{}` more than once",
                    self.name,
                    param.name
                );
            }
        }

        Ok(Arc::new(FunctionDescriptor {
            name: self.name,
            return_type: self.return_type,
            parameters: self.parameters,
            source: self.source,
            dependencies: self.dependencies,
            native: self.native,
        }))
    }
}

impl FunctionDescriptor {
    pub fn builder<N: Into<String>>(name: N) -> FunctionBuilder {
        FunctionBuilder::new(name)
    }
}

pub fn input(name: &str, element: ElementType) -> Parameter {
    Parameter::new(name, Direction::In, ParamKind::Array, element)
}

pub fn output(name: &str, element: ElementType) -> Parameter {
    Parameter::new(name, Direction::Out, ParamKind::Array, element)
}

pub fn inout(name: &str, element: ElementType) -> Parameter {
    Parameter::new(name, Direction::InOut, ParamKind::Array, element)
}

pub fn scalar(name: &str, element: ElementType) -> Parameter {
    Parameter::new(name, Direction::In, ParamKind::Scalar, element)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_signature() {
        let function = FunctionDescriptor::builder("scale")
            .returns(ElementType::Float)
            .param(input("x", ElementType::Float))
            .scalar("factor", ElementType::Float)
            .source("fn scale(x: ptr<function, x_record>, factor: f32) -> f32 { return (*x)[0] * factor; }")
            .build()
            .expect("descriptor");

        assert_eq!(function.name(), "scale");
        assert_eq!(function.parameters().len(), 2);
        assert!(function.parameters()[0].is_array());
        assert!(!function.return_type().is_void());
        assert!(function.native().is_none());
    }

    #[test]
    fn duplicate_parameter_names_are_rejected() {
        let result = FunctionDescriptor::builder("dup")
            .param(input("model.x", ElementType::Float))
            .param(input("model_x", ElementType::Float))
            .build();
        assert!(result.is_err());
    }
}
