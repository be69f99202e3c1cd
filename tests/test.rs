#[cfg(test)]

mod tests {
    use std::convert::Infallible;
    use std::sync::Arc;

    use insta::assert_snapshot;
    use kstruct::{
        adapter::{self, SchemaOnlyTypeAdapter, SteerableModel, TypeAdapter},
        automaton::Automaton,
        config::{Config, ProcessorConfig},
        index::{BuildIndexError, TokenTransitionIndex},
        pattern::{self, CompiledPattern},
        processor_like::{AcceptTokenError, AcceptTokenResult, ProcessorLike},
        types::{self, Primitive, TypeDescriptor},
        vocabulary::{Token, Vocabulary},
        processor::CreateProcessorError,
        BatchLogitsProcessor, LogitsProcessor,
    };
    use serde_json::{json, Value};

    fn vocabulary(tokens: &[&str], eos: Option<&str>) -> Arc<Vocabulary> {
        let mut vocab =
            Vocabulary::from_token_strings(tokens.iter().enumerate().map(|(i, t)| (i as u32, *t)))
                .unwrap();
        if let Some(eos) = eos {
            let id = get_token_id_from_str(&vocab, eos).unwrap();
            vocab = vocab.with_eos_token_id(id).unwrap();
        }
        Arc::new(vocab)
    }

    fn get_token_id_from_str(vocab: &Vocabulary, token: &str) -> Option<u32> {
        vocab.token_id(&Token(token.as_bytes().to_vec().into_boxed_slice()))
    }

    fn allowed_strings(processor: &LogitsProcessor) -> Vec<String> {
        let vocab = processor.vocab();
        processor
            .allowed_token_ids_from_last_computation()
            .ones()
            .map(|id| vocab.token_string(id as u32).unwrap().to_string())
            .collect()
    }

    fn uncached() -> Config {
        Config {
            processor_config: ProcessorConfig {
                cache_enabled: false,
            },
            ..Default::default()
        }
    }

    /// A model whose preferences never change, so greedy decoding is driven by the mask alone.
    struct FixedPreferenceModel {
        vocab: Arc<Vocabulary>,
        logits: Vec<f32>,
        calls: usize,
    }

    impl SteerableModel for FixedPreferenceModel {
        type Error = Infallible;

        fn vocabulary(&self) -> Arc<Vocabulary> {
            self.vocab.clone()
        }

        fn encode(&self, prompt: &str) -> Result<Vec<u32>, Infallible> {
            Ok(prompt
                .split_whitespace()
                .filter_map(|word| get_token_id_from_str(&self.vocab, word))
                .collect())
        }

        fn next_token_logits(&mut self, _token_ids: &[u32]) -> Result<Vec<f32>, Infallible> {
            self.calls += 1;
            Ok(self.logits.clone())
        }
    }

    const AGE_TOKENS: [&str; 9] = ["{", "}", " ", "\"age\"", ":", "2", "-", "a", "</s>"];

    fn age_model() -> FixedPreferenceModel {
        FixedPreferenceModel {
            vocab: vocabulary(&AGE_TOKENS, Some("</s>")),
            // "a" is the favourite but can never appear; "}" is preferred whenever it is allowed.
            logits: vec![1.0, 10.0, 9.0, 1.0, 1.0, 8.0, 7.0, 11.0, 0.0],
            calls: 0,
        }
    }

    #[test]
    fn age_object_scenario() {
        let schema = json!({
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        });
        let mut model = age_model();
        let mut processor =
            LogitsProcessor::new(&TypeDescriptor::JsonSchema(schema), model.vocabulary()).unwrap();
        let output = adapter::generate(&mut model, "a", Some(&mut processor), 32).unwrap();
        assert!(processor.is_finished());
        let parsed: Value = serde_json::from_str(&output.text).unwrap();
        let object = parsed.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object["age"].is_i64());
        assert_eq!(output.text, r#"{ "age" : 2}"#);
    }

    #[test]
    fn budget_truncates_an_unfinished_object() {
        let schema = json!({
            "type": "object",
            "properties": {"age": {"type": "integer"}},
            "required": ["age"]
        });
        let mut model = age_model();
        let mut processor =
            LogitsProcessor::new(&TypeDescriptor::JsonSchema(schema), model.vocabulary()).unwrap();
        let output = adapter::generate(&mut model, "", Some(&mut processor), 3).unwrap();
        assert_eq!(output.text, r#"{ "age""#);
        assert_eq!(output.token_ids.len(), 3);
        assert_eq!(model.calls, 3);
        assert!(!processor.is_finished());
        assert!(serde_json::from_str::<Value>(&output.text).is_err());
    }

    #[test]
    fn unconstrained_generation_follows_the_model() {
        let mut model = age_model();
        let output = adapter::generate(&mut model, "", None, 3).unwrap();
        assert_eq!(output.text, "aaa");
        assert_eq!(model.calls, 3);
    }

    #[test]
    fn digit_scenario() {
        let vocab = vocabulary(
            &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9", "12", "a", "</s>"],
            Some("</s>"),
        );
        let mut processor =
            LogitsProcessor::new(&TypeDescriptor::Regex("[0-9]".to_string()), vocab.clone())
                .unwrap();
        assert_eq!(
            allowed_strings(&processor),
            vec!["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"]
        );
        let seven = get_token_id_from_str(&vocab, "7").unwrap();
        assert_eq!(
            processor.try_accept_new_token(seven),
            Ok(AcceptTokenResult::Finished)
        );
        processor.compute_allowed_token_ids();
        assert_eq!(allowed_strings(&processor), vec!["</s>"]);
        processor.reset();
        let twelve = get_token_id_from_str(&vocab, "12").unwrap();
        assert_eq!(
            processor.try_accept_new_token(twelve),
            Err(AcceptTokenError::Rejected)
        );
    }

    #[test]
    fn choice_scenario() {
        let vocab = vocabulary(&["B", "ar", "F", "oo", "Bar", "Foo", "x", "</s>"], Some("</s>"));
        let choices = TypeDescriptor::Literal(vec![Value::from("Bar"), Value::from("Foo")]);
        let mut processor = LogitsProcessor::new(&choices, vocab.clone()).unwrap();
        assert_eq!(allowed_strings(&processor), vec!["B", "F", "Bar", "Foo"]);
        let mut logits = vec![0.0; vocab.vocab_size()];
        let b = get_token_id_from_str(&vocab, "B").unwrap();
        assert_eq!(
            processor.update_logits(b, &mut logits),
            Ok(AcceptTokenResult::Ongoing)
        );
        assert_eq!(allowed_strings(&processor), vec!["ar"]);
        let ar = get_token_id_from_str(&vocab, "ar").unwrap();
        assert_eq!(
            processor.try_accept_new_token(ar),
            Ok(AcceptTokenResult::Finished)
        );
        let text = String::from_utf8(vocab.decode(processor.generated_token_ids())).unwrap();
        assert_eq!(text, "Bar");
    }

    #[test]
    fn unsupported_type_against_a_schema_only_backend() {
        let error = TypeAdapter::<()>::format_output_type(
            &SchemaOnlyTypeAdapter,
            Some(&TypeDescriptor::Primitive(Primitive::Int)),
        )
        .unwrap_err();
        assert!(error.to_string().starts_with("The type `int` is not supported"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let schema = json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "maxLength": 4},
                "tags": {"type": "array", "items": {"enum": ["a", "b"]}}
            },
            "required": ["name"]
        });
        let spec = types::classify(&TypeDescriptor::JsonSchema(schema)).unwrap();
        let config = Config::default();
        let first = pattern::compile(&spec, &config).unwrap();
        let second = pattern::compile(&spec, &config).unwrap();
        assert_eq!(first, second);
        let CompiledPattern::Regex(regex) = first else {
            panic!("A JSON schema compiles to a regular expression.");
        };
        let a = Automaton::new(&regex, &config.regex_config).unwrap();
        let b = Automaton::new(&regex, &config.regex_config).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.state_count(), b.state_count());
    }

    #[test]
    fn index_building_is_idempotent() {
        let vocab = vocabulary(&["1", "23", "-", "0", ".", "e", "+", "</s>"], Some("</s>"));
        let automaton = Arc::new(Automaton::new(r"-?(0|[1-9][0-9]*)(\.[0-9]+)?", &Default::default()).unwrap());
        let first = TokenTransitionIndex::new(automaton.clone(), &vocab).unwrap();
        let second = TokenTransitionIndex::new(automaton, &vocab).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.key(), second.key());
    }

    #[test]
    fn no_reachable_silent_dead_ends() {
        let vocab = vocabulary(&["1", "2", "12", "-", ".", "x", "</s>"], Some("</s>"));
        let automaton = Arc::new(Automaton::new(r"-?[12]+\.[12]", &Default::default()).unwrap());
        let index = TokenTransitionIndex::new(automaton, &vocab).unwrap();
        let successors = |state: u32| index.transitions(state).iter().map(|&(_, next)| next);
        let mut reachable = vec![false; index.state_count()];
        let mut stack = vec![index.initial_state()];
        while let Some(state) = stack.pop() {
            if std::mem::replace(&mut reachable[state as usize], true) {
                continue;
            }
            stack.extend(successors(state));
        }
        for state in (0..index.state_count() as u32).filter(|&s| reachable[s as usize]) {
            assert!(
                index.is_accepting(state) || index.allowed_token_ids(state).ones().next().is_some(),
                "state {state} is a silent dead end"
            );
            // Every permitted token must keep an accepting state within reach.
            let mut seen = vec![false; index.state_count()];
            let mut stack = vec![state];
            let mut reaches_acceptance = false;
            while let Some(current) = stack.pop() {
                if std::mem::replace(&mut seen[current as usize], true) {
                    continue;
                }
                if index.is_accepting(current) {
                    reaches_acceptance = true;
                    break;
                }
                stack.extend(successors(current));
            }
            assert!(reaches_acceptance, "state {state} cannot reach acceptance");
            assert!(index.is_live(state));
        }
    }

    #[test]
    fn token_cycles_without_exit_fail_at_construction() {
        let vocab = vocabulary(&["a", "c", "</s>"], Some("</s>"));
        let result = LogitsProcessor::from_regex("a+b", vocab, &Config::default());
        assert!(matches!(
            result,
            Err(CreateProcessorError::Index(BuildIndexError::NoTokenPath(_)))
        ));
    }

    #[test]
    fn grammar_constraint_balances_parentheses() {
        let vocab = vocabulary(&["(", ")", "()", "x", "))", "</s>"], Some("</s>"));
        let cfg = TypeDescriptor::Cfg(r#"start ::= item+ ; item ::= "(" start ")" | "x" ;"#.to_string());
        let mut processor = LogitsProcessor::with_config(&cfg, vocab.clone(), &uncached()).unwrap();
        assert!(processor.index().is_none());
        assert_eq!(allowed_strings(&processor), vec!["(", "x"]);
        for token in ["(", "(", "x", "))"] {
            let id = get_token_id_from_str(&vocab, token).unwrap();
            assert_eq!(
                processor.try_accept_new_token(id),
                Ok(AcceptTokenResult::Ongoing)
            );
        }
        processor.compute_allowed_token_ids();
        assert_snapshot!(allowed_strings(&processor).join(" "), @"( x </s>");
        let eos = get_token_id_from_str(&vocab, "</s>").unwrap();
        assert_eq!(
            processor.try_accept_new_token(eos),
            Ok(AcceptTokenResult::Finished)
        );
    }

    #[test]
    fn batch_rows_follow_their_own_tokens() {
        let vocab = vocabulary(&["0", "1", "</s>"], Some("</s>"));
        let processor = LogitsProcessor::new(&TypeDescriptor::Primitive(Primitive::Bool), vocab);
        assert!(processor.is_err());

        let vocab = vocabulary(&["t", "rue", "f", "alse", "</s>"], Some("</s>"));
        let processor =
            LogitsProcessor::new(&TypeDescriptor::Primitive(Primitive::Bool), vocab).unwrap();
        let mut batch = BatchLogitsProcessor::new(processor);
        let mut logits = vec![0.0; 10];
        batch.process(&[vec![0], vec![2]], &mut logits).unwrap();
        let ninf = f32::NEG_INFINITY;
        assert_eq!(
            logits,
            vec![ninf, 0.0, ninf, ninf, ninf, ninf, ninf, ninf, 0.0, ninf]
        );
    }
}
